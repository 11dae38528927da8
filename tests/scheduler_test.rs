//! Integration tests for the Scheduler.

use std::collections::HashMap;
use std::sync::Arc;

use spindle::config::{CacheConfig, SamplingConfig, SchedulerConfig};
use spindle::core::request::{FinishReason, Request, RequestStatus};
use spindle::{CoreMetrics, Scheduler, VerificationResult};

fn config() -> SchedulerConfig {
    SchedulerConfig {
        max_num_seqs: 8,
        max_tokens_in_flight: 4096,
        max_prefill_tokens: 256,
        enable_chunked_prefill: false,
        chunk_size: 512,
        enable_preemption: true,
        max_deferrals: 4,
    }
}

fn scheduler(sched_config: SchedulerConfig, num_blocks: usize, block_size: usize) -> Scheduler {
    Scheduler::new(
        sched_config,
        &CacheConfig::new(num_blocks, block_size),
        Arc::new(CoreMetrics::new()),
    )
}

fn no_proposals() -> HashMap<u64, Vec<u32>> {
    HashMap::new()
}

#[test]
fn test_empty_scheduler() {
    let mut sched = scheduler(config(), 16, 16);
    assert_eq!(sched.num_waiting(), 0);
    assert_eq!(sched.num_running(), 0);
    assert!(!sched.has_unfinished_requests());
    assert!(sched.schedule(&no_proposals()).is_empty());
}

#[test]
fn test_basic_admission() {
    let mut sched = scheduler(config(), 16, 16);
    sched.add_request(Request::new(1, vec![1, 2, 3, 4], SamplingConfig::default()));

    let output = sched.schedule(&no_proposals());
    assert_eq!(output.prefill.len(), 1);
    assert_eq!(output.prefill[0].request_id, 1);
    assert_eq!(output.prefill[0].input_tokens, vec![1, 2, 3, 4]);
    assert_eq!(output.num_prefill_tokens, 4);
    assert_eq!(sched.num_running(), 1);
    assert_eq!(sched.num_waiting(), 0);
    assert!(output.block_tables.contains_key(&1));
}

#[test]
fn test_admission_respects_priority_then_fifo() {
    let mut sched = scheduler(config(), 64, 16);
    sched.add_request(Request::with_priority(1, vec![1], SamplingConfig::default(), 3));
    sched.add_request(Request::with_priority(2, vec![2], SamplingConfig::default(), 0));
    sched.add_request(Request::with_priority(3, vec![3], SamplingConfig::default(), 0));

    let output = sched.schedule(&no_proposals());
    let ids: Vec<u64> = output.prefill.iter().map(|p| p.request_id).collect();
    // Lower value first, FIFO within the class.
    assert_eq!(ids, vec![2, 3, 1]);
}

#[test]
fn test_no_request_scheduled_twice() {
    let mut sched = scheduler(config(), 64, 16);
    for id in 1..=5 {
        sched.add_request(Request::new(id, vec![1, 2, 3], SamplingConfig::default()));
    }
    let output = sched.schedule(&no_proposals());
    let ids = output.all_request_ids();
    let unique: std::collections::HashSet<_> = ids.iter().collect();
    assert_eq!(ids.len(), unique.len());
}

#[test]
fn test_decode_with_speculative_headroom() {
    let mut sched = scheduler(config(), 8, 4);
    let mut req = Request::new(1, vec![1, 2, 3], SamplingConfig::default());
    req.set_speculative_budget(4);
    sched.add_request(req);

    // Prefill completes and the first token is sampled.
    let output = sched.schedule(&no_proposals());
    assert_eq!(output.prefill.len(), 1);
    sched.apply_prefill(1, 3, Some(50)).unwrap();
    assert!(sched.get_request(1).unwrap().is_decode_phase());

    // Decode step with a 4-token proposal: pending token + drafts.
    let mut proposals = HashMap::new();
    proposals.insert(1u64, vec![9, 8, 7, 6]);
    let output = sched.schedule(&proposals);

    assert_eq!(output.decode.len(), 1);
    let entry = &output.decode[0];
    assert_eq!(entry.input_tokens[0], 50);
    assert_eq!(entry.draft_tokens, vec![9, 8, 7, 6]);
    assert_eq!(entry.input_tokens.len(), 5);
    assert!(sched.get_request(1).unwrap().block_table().num_tentative() > 0);
}

#[test]
fn test_apply_verification_commits_extension() {
    let mut sched = scheduler(config(), 8, 4);
    let mut req = Request::new(1, vec![1, 2, 3], SamplingConfig::default());
    req.set_speculative_budget(4);
    sched.add_request(req);

    sched.schedule(&no_proposals());
    sched.apply_prefill(1, 3, Some(50)).unwrap();

    let mut proposals = HashMap::new();
    proposals.insert(1u64, vec![5, 7, 2, 9]);
    let output = sched.schedule(&proposals);
    assert_eq!(output.decode[0].draft_tokens.len(), 4);

    // Target accepted [5, 7] and resampled 3.
    let result = VerificationResult {
        request_id: 1,
        accepted_len: 2,
        resampled: 3,
        tokens: vec![5, 7, 3],
    };
    let finish = sched.apply_verification(&result).unwrap();
    assert!(finish.is_none());

    let req = sched.get_request(1).unwrap();
    assert_eq!(req.output_token_ids(), &[50, 5, 7, 3]);
    // Pending token + 2 accepted drafts became cache-resident.
    assert_eq!(req.num_cached_tokens(), 6);
    assert_eq!(req.block_table().num_tentative(), 0);
}

#[test]
fn test_preemption_revokes_lower_priority() {
    let mut sched = scheduler(config(), 4, 4);

    // Low-priority request fills the whole pool (13 tokens = 4 blocks).
    let low = Request::with_priority(1, (0..13).collect(), SamplingConfig::default(), 10);
    sched.add_request(low);
    sched.schedule(&no_proposals());
    sched.apply_prefill(1, 13, Some(42)).unwrap();
    assert_eq!(sched.kv_cache().num_free_blocks(), 0);

    // A higher-priority arrival must displace it.
    let high = Request::with_priority(2, (100..109).collect(), SamplingConfig::default(), 0);
    sched.add_request(high);
    let output = sched.schedule(&no_proposals());

    assert_eq!(output.preempted, vec![1]);
    assert_eq!(
        sched.get_request(1).unwrap().status(),
        RequestStatus::Preempted
    );
    // The victim's token history is retained for resumption.
    assert_eq!(sched.get_request(1).unwrap().total_len(), 14);
    let ids = output.all_request_ids();
    assert!(ids.contains(&2));
    assert!(!ids.contains(&1), "preempted request must leave the batch");
}

#[test]
fn test_preempted_request_resumes() {
    let mut sched = scheduler(config(), 4, 4);
    let low = Request::with_priority(1, (0..13).collect(), SamplingConfig::default(), 10);
    sched.add_request(low);
    sched.schedule(&no_proposals());
    sched.apply_prefill(1, 13, Some(42)).unwrap();

    let high = Request::with_priority(2, (100..109).collect(), SamplingConfig::default(), 0);
    sched.add_request(high);
    sched.schedule(&no_proposals());
    assert_eq!(sched.num_preempted(), 1);

    // Finish the high-priority request; the next step resumes the victim.
    sched.finish_request(2, FinishReason::MaxTokens);
    let output = sched.schedule(&no_proposals());
    assert_eq!(sched.num_preempted(), 0);
    assert_eq!(
        sched.get_request(1).unwrap().status(),
        RequestStatus::Running
    );
    // Resumption re-prefills the uncached tail of its history.
    assert_eq!(output.prefill.len(), 1);
    assert_eq!(output.prefill[0].request_id, 1);
}

#[test]
fn test_bounded_deferrals_fail_request() {
    let sched_config = SchedulerConfig {
        enable_preemption: false,
        max_deferrals: 1,
        ..config()
    };
    let mut sched = scheduler(sched_config, 1, 4);

    sched.add_request(Request::new(1, vec![1, 2, 3, 4], SamplingConfig::default()));
    sched.schedule(&no_proposals());
    assert_eq!(sched.num_running(), 1);

    sched.add_request(Request::new(2, vec![5, 6, 7, 8], SamplingConfig::default()));

    // First failure defers, second exceeds the bound and fails it.
    sched.schedule(&no_proposals());
    assert_eq!(
        sched.get_request(2).unwrap().status(),
        RequestStatus::Waiting
    );
    sched.schedule(&no_proposals());
    assert_eq!(
        sched.get_request(2).unwrap().status(),
        RequestStatus::Finished
    );
    assert_eq!(
        sched.get_request(2).unwrap().finish_reason(),
        Some(FinishReason::Failed)
    );
}

#[test]
fn test_cancellation_sweep_releases_blocks() {
    let mut sched = scheduler(config(), 8, 4);
    sched.add_request(Request::new(1, (0..8).collect(), SamplingConfig::default()));
    sched.schedule(&no_proposals());
    assert!(sched.kv_cache().num_used_blocks() > 0);

    sched.cancel(1).unwrap();
    let swept = sched.sweep_expired();
    assert_eq!(swept, vec![(1, FinishReason::Cancelled)]);
    assert_eq!(
        sched.get_request(1).unwrap().status(),
        RequestStatus::Finished
    );
    assert_eq!(sched.num_running(), 0);
    // Blocks are released (reusable or free, but no longer referenced).
    assert_eq!(sched.kv_cache().num_available_blocks(), 8);
}

#[test]
fn test_tokens_in_flight_budget() {
    let sched_config = SchedulerConfig {
        max_tokens_in_flight: 5,
        ..config()
    };
    let mut sched = scheduler(sched_config, 16, 4);

    sched.add_request(Request::new(1, vec![1, 2, 3, 4], SamplingConfig::default()));
    sched.add_request(Request::new(2, vec![5, 6, 7, 8], SamplingConfig::default()));

    let output = sched.schedule(&no_proposals());
    assert_eq!(output.prefill.len(), 1);
    assert_eq!(sched.num_running(), 1);
    assert_eq!(
        sched.get_request(2).unwrap().status(),
        RequestStatus::Waiting
    );
}

#[test]
fn test_stop_token_and_max_tokens() {
    let mut sched = scheduler(config(), 16, 4);
    let sampling = SamplingConfig {
        max_tokens: 2,
        stop_token_ids: vec![99],
        ..Default::default()
    };
    sched.add_request(Request::new(1, vec![1, 2, 3], sampling.clone()));
    sched.schedule(&no_proposals());

    // Stop token wins immediately.
    let finish = sched.apply_prefill(1, 3, Some(99)).unwrap();
    assert_eq!(finish, Some(FinishReason::StopToken));

    // Length cap on a separate request.
    sched.add_request(Request::new(2, vec![1, 2, 3], sampling));
    sched.schedule(&no_proposals());
    sched.apply_prefill(2, 3, Some(10)).unwrap();
    sched.schedule(&no_proposals());
    let finish = sched.apply_decode_token(2, 11).unwrap();
    assert_eq!(finish, Some(FinishReason::MaxTokens));
}
