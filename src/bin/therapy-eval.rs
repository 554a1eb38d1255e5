use std::{path::PathBuf, process::ExitCode, sync::Arc, time::Duration};

use clap::Parser;
use rand::{rngs::StdRng, SeedableRng};
use therapy_eval::{
    providers::{
        openai::OpenAI,
        scripted::{ScriptedProvider, ScriptedTurn},
    },
    BatchEvent, ConcurrencyScheduler, ConfigError, ConversationResult, ConversationRunner, EvalConfig,
    EvalReport, LLMProvider, PersonaCatalog,
};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DRY_RUN_SCORE: &str = r#"{"empathy_reflection": 7, "validation_affirmation": 6, "question_quality": 6,
"supportive_tone": 8, "alliance_goal": 2, "alliance_approach": 2, "alliance_bond": 3,
"alliance_score": 7, "overall_score": 7, "strengths": "Warm and patient.",
"improvements": "Ask more open questions.", "red_flags": null}"#;

#[derive(Parser)]
#[command(name = "therapy-eval")]
#[command(about = "Run simulated therapy conversations and score the therapist")]
struct Args {
    /// Number of conversations to run
    #[arg(short = 'n', long, default_value_t = 10)]
    conversations: usize,

    /// Print per-conversation strengths, improvements and red flags
    #[arg(short, long)]
    verbose: bool,

    /// Skip writing the results file
    #[arg(long)]
    no_save: bool,

    /// Print the full transcript of conversation N (1-based)
    #[arg(short = 't', long, value_name = "N")]
    show_transcript: Option<usize>,

    /// Model name; overrides THERAPY_EVAL_MODEL
    #[arg(long)]
    model: Option<String>,

    /// Turns per conversation; overrides THERAPY_EVAL_TURNS
    #[arg(long)]
    turns: Option<usize>,

    /// Concurrency ceiling; overrides THERAPY_EVAL_MAX_CONCURRENT
    #[arg(long)]
    concurrency: Option<usize>,

    /// YAML persona catalog instead of the built-in one
    #[arg(long)]
    personas: Option<PathBuf>,

    /// Seed for persona selection
    #[arg(long)]
    seed: Option<u64>,

    /// Use canned replies instead of calling the model
    #[arg(long)]
    dry_run: bool,
}

fn dry_run_runner(config: &EvalConfig) -> ConversationRunner {
    let latency = Duration::from_millis(20);
    let client = ScriptedProvider::new().with_fallback(
        ScriptedTurn::reply("I keep going back and forth about whether this is worth talking about.")
            .with_latency(latency),
    );
    let therapist = ScriptedProvider::new().with_fallback(
        ScriptedTurn::reply("It sounds like part of you wants support. What feels hardest right now?")
            .with_latency(latency),
    );
    let scorer =
        ScriptedProvider::new().with_fallback(ScriptedTurn::reply(DRY_RUN_SCORE).with_latency(latency));

    ConversationRunner::with_providers(
        Arc::new(client),
        Arc::new(therapist),
        Arc::new(scorer),
        config,
    )
}

fn print_report(report: &EvalReport, args: &Args) {
    println!("{}", report.render_summary());

    if args.verbose {
        println!();
        println!("{}", report.render_details());
    }

    if let Some(number) = args.show_transcript {
        match report.render_transcript(number) {
            Some(transcript) => {
                println!();
                println!("{transcript}");
            }
            None => warn!(number, available = report.results.len(), "no such conversation"),
        }
    }
}

fn finish(report: &EvalReport, config: &EvalConfig, args: &Args) {
    print_report(report, args);
    if args.no_save {
        return;
    }
    match report.save(&config.results_dir) {
        Ok(path) => println!("\nResults saved to: {}", path.display()),
        Err(err) => error!(error = %err, dir = %config.results_dir.display(), "failed to save results"),
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,therapy_eval=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let mut config = EvalConfig::from_env()?;
    if let Some(model) = &args.model {
        config = config.with_model(model.clone());
    }
    if let Some(turns) = args.turns {
        config = config.with_turns(turns);
    }
    if let Some(limit) = args.concurrency {
        config = config.with_max_concurrent_conversations(limit);
    }
    config.validate()?;

    let catalog = match &args.personas {
        Some(path) => PersonaCatalog::from_yaml_file(path)?,
        None => PersonaCatalog::builtin(),
    };
    if args.conversations > catalog.len() {
        warn!(
            requested = args.conversations,
            available = catalog.len(),
            "not enough personas, running each once"
        );
    }
    let personas = match args.seed {
        Some(seed) => catalog.pick(args.conversations, &mut StdRng::seed_from_u64(seed)),
        None => catalog.pick(args.conversations, &mut rand::thread_rng()),
    };

    let runner = if args.dry_run {
        dry_run_runner(&config)
    } else {
        let openai = OpenAI::from_env(config.api_timeout).map_err(ConfigError::from)?;
        let provider: Arc<dyn LLMProvider> = Arc::new(openai);
        ConversationRunner::from_config(provider, &config)
    };

    info!(
        model = %config.model,
        conversations = personas.len(),
        turns = config.turns,
        limit = config.max_concurrent_conversations,
        dry_run = args.dry_run,
        "starting evaluation"
    );

    let scheduler = ConcurrencyScheduler::new(Arc::new(runner), config.max_concurrent_conversations)?
        .with_event_callback(|event| match event {
            BatchEvent::Started { index, persona } => {
                info!(index, persona = %persona, "conversation started")
            }
            BatchEvent::Finished {
                index,
                persona,
                overall_score,
                degraded,
                duration,
            } => info!(
                index,
                persona = %persona,
                overall_score,
                degraded,
                seconds = duration.as_secs_f64(),
                "conversation scored"
            ),
            BatchEvent::Failed {
                index,
                persona,
                error,
            } => error!(index, persona = %persona, error = %error, "conversation failed"),
        });

    let outcome = scheduler.run_all(personas).await;
    let (results, failure): (Vec<ConversationResult>, _) = match outcome {
        Ok(results) => (results, None),
        Err(err) => {
            let message = err.to_string();
            (err.completed, Some(message))
        }
    };

    let report = EvalReport::new(&config, results);
    finish(&report, &config, &args);

    match failure {
        None => Ok(ExitCode::SUCCESS),
        Some(message) => {
            eprintln!("\nEvaluation failed: {message}");
            Ok(ExitCode::FAILURE)
        }
    }
}
