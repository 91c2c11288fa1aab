use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use artforge_contracts::artifacts::{artifact_stem, write_artifacts, Artwork};
use artforge_contracts::events::{new_session_id, EventLog};
use artforge_contracts::request::{parse_size, GenerationRequest};
use artforge_contracts::StepId;
use artforge_engine::agents::{ChainInput, DirectorSettings, FailurePolicy};
use artforge_engine::cancel::CancelToken;
use artforge_engine::config::EngineConfig;
use artforge_engine::ArtEngine;
use clap::{Parser, Subcommand};
use serde_json::{json, Map, Value};

#[derive(Debug, Parser)]
#[command(name = "artforge", version, about = "Concept-to-artwork generation pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the full agent chain for a concept and write the artifacts.
    Generate(GenerateArgs),
    /// Send a raw prompt through the backend ladder only.
    Image(ImageArgs),
    /// Print the resolved backend catalog and ladder order.
    Backends(BackendsArgs),
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    concept: String,
    /// Forced attribute, `key=value`; repeatable.
    #[arg(long = "force", value_name = "KEY=VALUE")]
    force: Vec<String>,
    #[arg(long)]
    series: Option<String>,
    #[arg(long)]
    category: Option<String>,
    /// Step failure policy override, `step=propagate|substitute`; repeatable.
    #[arg(long = "policy", value_name = "STEP=POLICY")]
    policy: Vec<String>,
    #[arg(long, default_value = "out")]
    out: PathBuf,
    #[arg(long)]
    name: Option<String>,
    #[arg(long, default_value_t = 1024)]
    width: u32,
    #[arg(long, default_value_t = 1024)]
    height: u32,
    /// Wall-clock limit for the whole run, in seconds.
    #[arg(long)]
    timeout: Option<f64>,
    #[arg(long)]
    events: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct ImageArgs {
    #[arg(long)]
    prompt: String,
    #[arg(long)]
    negative_prompt: Option<String>,
    #[arg(long, default_value = "1024x1024")]
    size: String,
    #[arg(long)]
    steps: Option<u32>,
    #[arg(long)]
    guidance: Option<f64>,
    /// Extra backend parameter, `key=value`; repeatable.
    #[arg(long = "extra", value_name = "KEY=VALUE")]
    extra: Vec<String>,
    #[arg(long)]
    out: Option<PathBuf>,
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    timeout: Option<f64>,
    #[arg(long)]
    events: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct BackendsArgs {
    /// Catalog file to overlay on the built-in defaults.
    #[arg(long)]
    catalog: Option<PathBuf>,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("artforge error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Generate(args) => run_generate(args),
        Command::Image(args) => run_image(args),
        Command::Backends(args) => run_backends(args),
    }
}

fn run_generate(args: GenerateArgs) -> Result<i32> {
    let events = open_events(args.events.as_deref(), Some(&args.out))?;
    let settings = DirectorSettings {
        width: args.width,
        height: args.height,
        policy_overrides: parse_policies(&args.policy)?,
        ..DirectorSettings::default()
    };
    let engine = ArtEngine::new(EngineConfig::from_env(), settings, events)?;
    let input = ChainInput {
        concept: args.concept.clone(),
        forced_attributes: parse_pairs(&args.force)?,
        series: args.series.clone(),
        category: args.category.clone(),
    };
    let cancel = cancel_token(args.timeout)?;

    let result = engine.run_chain(&input, &cancel);
    for message in &result.messages {
        println!("  {message}");
    }
    let Some(artwork) = result.artwork.as_ref().filter(|_| result.success) else {
        let error = result.error.as_deref().unwrap_or("unknown failure");
        match result.failed_step {
            Some(step) => eprintln!("artforge: generation failed at {step}: {error}"),
            None => eprintln!("artforge: generation failed: {error}"),
        }
        return Ok(1);
    };

    let name = args.name.clone().unwrap_or_else(|| args.concept.clone());
    save_artwork(&engine, &args.out, &name, artwork)?;
    println!(
        "artforge: {} via {} ({} attempt{})",
        artwork.image_url,
        artwork.backend,
        result.attempts.len(),
        if result.attempts.len() == 1 { "" } else { "s" }
    );
    Ok(0)
}

fn run_image(args: ImageArgs) -> Result<i32> {
    let events = open_events(args.events.as_deref(), args.out.as_deref())?;
    let (width, height) = parse_size(&args.size)?;
    let mut request = GenerationRequest::new(args.prompt.clone()).with_size(width, height);
    if let Some(negative) = &args.negative_prompt {
        request = request.with_negative_prompt(negative.clone());
    }
    if let Some(steps) = args.steps {
        request = request.with_steps(steps);
    }
    if let Some(guidance) = args.guidance {
        request = request.with_guidance_scale(guidance);
    }
    for (key, value) in parse_pairs(&args.extra)? {
        request = request.with_extra(key, value);
    }
    request.validate()?;

    let engine = ArtEngine::new(EngineConfig::from_env(), DirectorSettings::default(), events)?;
    let cancel = cancel_token(args.timeout)?;
    let outcome = engine.generate_image(&request, &cancel)?;

    if let Some(out) = &args.out {
        let artwork = Artwork {
            image_url: outcome.image_url.clone(),
            prompt: request.prompt.clone(),
            negative_prompt: request.negative_prompt.clone(),
            backend: outcome.backend.clone(),
            metadata: Map::new(),
        };
        let name = args.name.clone().unwrap_or_else(|| args.prompt.clone());
        save_artwork(&engine, out, &name, &artwork)?;
    }
    println!(
        "artforge: {} via {} ({})",
        outcome.image_url, outcome.backend, outcome.rung
    );
    Ok(0)
}

fn run_backends(args: BackendsArgs) -> Result<i32> {
    let mut config = EngineConfig::from_env();
    if let Some(path) = args.catalog {
        config.catalog_path = Some(path);
    }
    let catalog = config.load_catalog()?;
    let order: Vec<&str> = catalog
        .ladder_backends()
        .iter()
        .map(|backend| backend.id.as_str())
        .collect();
    let mut summary = catalog.to_json();
    if let Value::Object(map) = &mut summary {
        map.insert("order".to_string(), json!(order));
    }
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(0)
}

fn save_artwork(engine: &ArtEngine, out: &Path, name: &str, artwork: &Artwork) -> Result<()> {
    let paths = write_artifacts(out, name, artwork)
        .with_context(|| format!("failed writing artifacts for '{}'", artifact_stem(name)))?;
    engine.record_artifacts(&[
        ("prompt_path", paths.prompt_path.as_path()),
        ("image_path", paths.image_path.as_path()),
        ("metadata_path", paths.metadata_path.as_path()),
    ]);
    println!("  wrote {}", paths.metadata_path.display());
    if let Some(log) = engine.events().path() {
        println!("  events {}", log.display());
    }
    Ok(())
}

fn open_events(explicit: Option<&Path>, out: Option<&Path>) -> Result<EventLog> {
    let path = match (explicit, out) {
        (Some(path), _) => path.to_path_buf(),
        (None, Some(out)) => out.join("events.jsonl"),
        (None, None) => return Ok(EventLog::disabled()),
    };
    Ok(EventLog::new(path, new_session_id()))
}

fn cancel_token(timeout: Option<f64>) -> Result<CancelToken> {
    match timeout {
        None => Ok(CancelToken::new()),
        Some(seconds) if seconds.is_finite() && seconds > 0.0 => {
            let Ok(timeout) = Duration::try_from_secs_f64(seconds) else {
                bail!("--timeout is too large (got {seconds})");
            };
            Ok(CancelToken::with_timeout(timeout))
        }
        Some(seconds) => bail!("--timeout must be a positive number of seconds (got {seconds})"),
    }
}

/// `key=value` pairs; values that parse as JSON keep their type.
fn parse_pairs(raw: &[String]) -> Result<Map<String, Value>> {
    let mut out = Map::new();
    for item in raw {
        let Some((key, value)) = item.split_once('=') else {
            bail!("expected KEY=VALUE, got '{item}'");
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("empty key in '{item}'");
        }
        let value = value.trim();
        let parsed = serde_json::from_str::<Value>(value)
            .ok()
            .filter(|parsed| !parsed.is_object() && !parsed.is_array())
            .unwrap_or_else(|| Value::String(value.to_string()));
        out.insert(key.to_string(), parsed);
    }
    Ok(out)
}

fn parse_policies(raw: &[String]) -> Result<HashMap<StepId, FailurePolicy>> {
    let mut out = HashMap::new();
    for item in raw {
        let Some((step, policy)) = item.split_once('=') else {
            bail!("expected STEP=POLICY, got '{item}'");
        };
        let Some(step) = StepId::parse(step) else {
            bail!("unknown step '{}'", step.trim());
        };
        let Some(policy) = FailurePolicy::parse(policy) else {
            bail!("unknown policy '{}' (use propagate or substitute)", policy.trim());
        };
        out.insert(step, policy);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use artforge_contracts::StepId;
    use artforge_engine::agents::FailurePolicy;
    use clap::Parser;
    use serde_json::json;

    use super::{cancel_token, open_events, parse_pairs, parse_policies, Cli, Command};

    #[test]
    fn forced_attributes_keep_scalar_types() {
        let pairs = parse_pairs(&[
            "hat=crown".to_string(),
            "level=3".to_string(),
            "shiny = true".to_string(),
        ])
        .unwrap();
        assert_eq!(pairs["hat"], json!("crown"));
        assert_eq!(pairs["level"], json!(3));
        assert_eq!(pairs["shiny"], json!(true));
        assert!(parse_pairs(&["novalue".to_string()]).is_err());
        assert!(parse_pairs(&["=x".to_string()]).is_err());
    }

    #[test]
    fn policy_overrides_parse_step_aliases() {
        let policies = parse_policies(&[
            "critic=propagate".to_string(),
            "metadata=substitute".to_string(),
        ])
        .unwrap();
        assert_eq!(policies[&StepId::Critic], FailurePolicy::PropagateOnFailure);
        assert_eq!(
            policies[&StepId::MetadataGenerator],
            FailurePolicy::SubstituteOnFailure
        );
        assert!(parse_policies(&["painter=propagate".to_string()]).is_err());
        assert!(parse_policies(&["critic=maybe".to_string()]).is_err());
    }

    #[test]
    fn generate_command_parses_repeated_flags() {
        let cli = Cli::try_parse_from([
            "artforge",
            "generate",
            "a bear portrait",
            "--force",
            "hat=crown",
            "--force",
            "cape=red",
            "--series",
            "forest-kings",
            "--width",
            "1440",
        ])
        .unwrap();
        let Command::Generate(args) = cli.command else {
            panic!("expected generate");
        };
        assert_eq!(args.concept, "a bear portrait");
        assert_eq!(args.force.len(), 2);
        assert_eq!(args.series.as_deref(), Some("forest-kings"));
        assert_eq!(args.width, 1440);
        assert_eq!(args.height, 1024);
    }

    #[test]
    fn events_default_next_to_output() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let log = open_events(None, Some(temp.path()))?;
        assert_eq!(log.path(), Some(temp.path().join("events.jsonl").as_path()));
        assert!(open_events(None, None)?.path().is_none());
        Ok(())
    }

    #[test]
    fn timeout_must_be_positive() {
        assert!(cancel_token(Some(0.0)).is_err());
        assert!(cancel_token(Some(2.5)).unwrap().deadline().is_some());
        assert!(cancel_token(None).unwrap().deadline().is_none());
    }

    #[test]
    fn oversized_timeouts_do_not_panic() {
        assert!(cancel_token(Some(1e20)).is_err());
        assert!(cancel_token(Some(1e19)).unwrap().deadline().is_none());
    }
}
