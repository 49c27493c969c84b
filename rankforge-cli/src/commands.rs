//! CLI subcommand handlers.

use crate::console::{ConsoleCallback, session_row};
use crate::{Commands, CorpusArgs, RunArgs};
use anyhow::Context;
use rankforge_core::adapters::classifier::Tokenizer;
use rankforge_core::config::EngineConfig;
use rankforge_core::data::{Dataset, TrainingData};
use rankforge_core::error::EngineError;
use rankforge_core::model::BaseModel;
use rankforge_core::orchestrator::{Orchestrator, TrainingInputs};
use rankforge_core::persistence::JsonFileStore;
use rankforge_core::quantize::QuantizationMode;
use rankforge_core::training::{BertConfig, ModelConfiguration, ModelType, TrainingSession, TrainingStatus};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Sequence length and class count of the synthetic corpus for the
/// weight-reconstructing adapters.
const SYNTHETIC_SEQ_LEN: usize = 16;
const SYNTHETIC_VOCAB: u32 = 512;
const SYNTHETIC_CLASSES: usize = 4;

/// Handle a CLI subcommand.
pub async fn handle_command(command: Commands, config: EngineConfig, quiet: bool) -> anyhow::Result<()> {
    if let Commands::Config = command {
        print!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    debug!(data_dir = %config.storage.data_dir.display(), "Opening session store");
    let store = Arc::new(JsonFileStore::new(&config.storage.data_dir));
    let orch = Orchestrator::open(store, config).await?;

    match command {
        Commands::Run(args) => handle_run(&orch, args, quiet).await,
        Commands::Resume { id, corpus } => {
            let session = orch.get_session(&id).await?;
            let inputs = synthetic_inputs(session.model_type, &session.configuration, &corpus);
            drive(&orch, &id, inputs, quiet).await?;
            Ok(())
        }
        Commands::List => {
            let sessions = orch.list_sessions().await;
            if sessions.is_empty() {
                println!("No sessions.");
            }
            for session in sessions {
                println!("{}", session_row(&session));
            }
            Ok(())
        }
        Commands::Show { id } => {
            let session = orch.get_session(&id).await?;
            println!("{}", serde_json::to_string_pretty(&session)?);
            Ok(())
        }
        Commands::Checkpoints { id } => {
            let checkpoints = orch.list_checkpoints(&id).await?;
            if checkpoints.is_empty() {
                println!("No checkpoints.");
            }
            for c in checkpoints {
                println!(
                    "{}  epoch {:>3}  step {:>6}  {:>9} bytes  {}  {}",
                    c.id,
                    c.epoch,
                    c.step,
                    c.size_bytes,
                    c.created_at.format("%Y-%m-%d %H:%M:%S"),
                    c.description
                );
            }
            Ok(())
        }
        Commands::Checkpoint { id, description } => {
            let reference = orch.create_checkpoint(&id, &description).await?;
            println!(
                "Created checkpoint {} at epoch {}, step {}",
                reference.id, reference.epoch, reference.step
            );
            Ok(())
        }
        Commands::Restore { id, checkpoint } => {
            let session = orch.restore_checkpoint(&id, &checkpoint).await?;
            println!(
                "Session {} rewound to step {}; `rankforge resume {}` continues from there",
                session.id, session.progress.current_step, session.id
            );
            Ok(())
        }
        Commands::Delete { id } => {
            orch.delete_session(&id).await?;
            println!("Deleted session {id}");
            Ok(())
        }
        Commands::Config => Ok(()),
    }
}

async fn handle_run(orch: &Orchestrator, args: RunArgs, quiet: bool) -> anyhow::Result<()> {
    let (model_type, configuration) = model_configuration(&args)?;
    let session = orch.create_session(&args.name, model_type, configuration).await?;
    println!("Created {} session {} ({})", session.model_type, session.id, session.name);

    let inputs = synthetic_inputs(model_type, &session.configuration, &args.corpus);
    let session = drive(orch, &session.id, inputs, quiet).await?;

    if session.status == TrainingStatus::Completed {
        for text in &args.classify {
            let prediction = orch.classify(&session.id, text).await?;
            println!(
                "{:<14} {:>6.1}%  {text}",
                prediction.category,
                prediction.confidence * 100.0
            );
        }
    }
    Ok(())
}

/// Start a session and wait for it to end. Ctrl-C pauses it.
async fn drive(orch: &Orchestrator, id: &str, inputs: TrainingInputs, quiet: bool) -> anyhow::Result<TrainingSession> {
    let started = orch.start(id, inputs, Arc::new(ConsoleCallback::new(quiet))).await?;
    if started.progress.current_step > 0 {
        println!(
            "Resuming at step {}/{}",
            started.progress.current_step, started.progress.total_steps
        );
    }

    let session = tokio::select! {
        done = orch.wait(id) => done?,
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for Ctrl-C")?;
            println!("Stopping at the next batch boundary...");
            match orch.stop(id).await {
                Ok(session) => session,
                // The run ended on its own while the signal arrived.
                Err(EngineError::InvalidState { .. }) => orch.get_session(id).await?,
                Err(e) => return Err(e.into()),
            }
        }
    };

    if session.status == TrainingStatus::Failed {
        anyhow::bail!(
            "session {} failed: {}",
            session.id,
            session.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(session)
}

/// Build the session configuration from a file or from flags.
fn model_configuration(args: &RunArgs) -> anyhow::Result<(ModelType, ModelConfiguration)> {
    let explicit_type = args
        .model_type
        .as_deref()
        .map(str::parse::<ModelType>)
        .transpose()?;

    let mut configuration = match &args.config {
        Some(path) => read_configuration(path)?,
        None => match explicit_type.unwrap_or(ModelType::Dora) {
            ModelType::Dora => ModelConfiguration::dora(args.rank, args.targets.clone()),
            ModelType::QuantizedRank => ModelConfiguration::quantized_rank(
                args.quantization.parse::<QuantizationMode>()?,
                args.compression_ratio,
                args.targets.clone(),
            ),
            ModelType::SequenceClassifier => ModelConfiguration::sequence_classifier(BertConfig::default()),
        },
    };

    if let Some(epochs) = args.epochs {
        configuration.epochs = epochs;
    }
    if let Some(batch_size) = args.batch_size {
        configuration.batch_size = batch_size;
    }
    if let Some(learning_rate) = args.learning_rate {
        configuration.learning_rate = learning_rate;
    }
    if let Some(seed) = args.seed {
        configuration.seed = Some(seed);
    }

    let model_type = explicit_type
        .or_else(|| configuration.inferred_model_type())
        .context("cannot infer the model type; pass --model-type")?;
    Ok((model_type, configuration))
}

fn read_configuration(path: &Path) -> anyhow::Result<ModelConfiguration> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let configuration = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => toml::from_str(&text)?,
        _ => serde_json::from_str(&text)?,
    };
    Ok(configuration)
}

/// Deterministic base model and corpus for a session.
fn synthetic_inputs(model_type: ModelType, configuration: &ModelConfiguration, corpus: &CorpusArgs) -> TrainingInputs {
    let (base_model, seq_len, vocab, classes) = match (model_type, &configuration.bert_config) {
        (ModelType::SequenceClassifier, Some(bert)) => (
            BaseModel::new("synthetic-classifier"),
            bert.max_length.saturating_sub(2).max(1),
            Tokenizer::new().vocab_size() as u32,
            bert.categories.len(),
        ),
        _ => (
            BaseModel::synthetic_transformer(corpus.hidden, corpus.blocks, corpus.data_seed),
            SYNTHETIC_SEQ_LEN,
            SYNTHETIC_VOCAB,
            SYNTHETIC_CLASSES,
        ),
    };
    let train = Dataset::synthetic(corpus.samples, seq_len, vocab, classes, corpus.data_seed);
    let validation = (corpus.validation_samples > 0).then(|| {
        Dataset::synthetic(
            corpus.validation_samples,
            seq_len,
            vocab,
            classes,
            corpus.data_seed.wrapping_add(1),
        )
    });
    TrainingInputs::new(base_model, TrainingData::new(train, validation))
}
