use clap::Parser;

use spindle::{
    EngineConfig, ModelExecutor, Result, SamplingConfig, SchedulerOutput, ServingEngine,
    StepOutput,
};

#[derive(Parser, Debug)]
#[command(name = "spindle")]
#[command(about = "Serving-engine execution core demo (paged cache + speculative decoding)")]
struct Args {
    /// Comma-separated prompt token ids
    #[arg(short, long, default_value = "0,1,2,3")]
    prompt: String,

    /// Number of identical requests to submit (shows prefix sharing)
    #[arg(short, long, default_value = "2")]
    requests: usize,

    /// Maximum tokens to generate per request
    #[arg(long, default_value = "64")]
    max_tokens: usize,

    /// Toy model vocabulary size (also its cycle period)
    #[arg(long, default_value = "16")]
    vocab: usize,

    /// Speculative tokens per step (0 disables speculation)
    #[arg(long, default_value = "4")]
    spec_tokens: usize,
}

/// Toy model: deterministically continues the cycle `t -> (t + 1) % vocab`.
///
/// Its output is perfectly periodic, so the n-gram proposer locks onto the
/// pattern after one period and verification accepts nearly every draft —
/// a small end-to-end showcase of the speculative path.
struct CycleExecutor {
    vocab: usize,
}

impl CycleExecutor {
    fn row(&self, token: u32) -> Vec<f32> {
        let mut row = vec![0.0f32; self.vocab];
        row[(token as usize + 1) % self.vocab] = 32.0;
        row
    }

    fn logits_for(&self, inputs: &[u32]) -> Result<candle_core::Tensor> {
        let rows: Vec<f32> = inputs.iter().flat_map(|&t| self.row(t)).collect();
        Ok(candle_core::Tensor::from_vec(
            rows,
            (inputs.len(), self.vocab),
            &candle_core::Device::Cpu,
        )?)
    }
}

impl ModelExecutor for CycleExecutor {
    fn execute(&mut self, batch: &SchedulerOutput) -> Result<StepOutput> {
        let mut output = StepOutput::default();
        for entry in &batch.prefill {
            output
                .logits
                .insert(entry.request_id, self.logits_for(&entry.input_tokens)?);
        }
        for entry in &batch.decode {
            output
                .logits
                .insert(entry.request_id, self.logits_for(&entry.input_tokens)?);
        }
        Ok(output)
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let prompt: Vec<u32> = args
        .prompt
        .split(',')
        .filter_map(|s| s.trim().parse().ok())
        .map(|t: u32| t % args.vocab as u32)
        .collect();

    let mut config = EngineConfig::default();
    config.speculative.num_speculative_tokens = args.spec_tokens;
    config.speculative.enabled = args.spec_tokens > 0;

    let executor = CycleExecutor { vocab: args.vocab };
    let mut engine = ServingEngine::new(config, Box::new(executor))?;

    let sampling = SamplingConfig::greedy().max_tokens(args.max_tokens);
    let mut ids = Vec::new();
    for _ in 0..args.requests {
        ids.push(engine.submit(prompt.clone(), sampling.clone(), 0)?);
    }

    engine.run_to_completion(args.max_tokens * 4 + 16)?;

    for id in ids {
        match engine.poll(id)? {
            spindle::PollResponse::Finished {
                output_tokens,
                reason,
            } => {
                println!("request {id}: {} tokens ({reason:?})", output_tokens.len());
                println!("  {:?}", output_tokens);
            }
            other => println!("request {id}: {other:?}"),
        }
    }

    println!("\nmetrics: {}", serde_json::to_string_pretty(&engine.metrics())?);
    Ok(())
}
