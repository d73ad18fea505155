use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use frameline_contracts::events::{EventKind, EventLog};
use frameline_contracts::runs::receipts::{build_receipt, write_receipt, ReceiptParts};
use frameline_contracts::runs::summary::{write_summary, RunSummary};
use frameline_contracts::{
    GroupContext, Outcome, QuickVerification, SceneStateSnapshot, StateTracker, TrackerExport,
    VerificationResult,
};
use frameline_engine::{
    amend, event_payload, render, ContinuityEngine, EngineConfig, ImageData, SceneRequest,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};

#[derive(Debug, Parser)]
#[command(name = "frameline", version, about = "Continuity-enforced scene image generation")]
struct Cli {
    #[command(flatten)]
    models: ModelArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct ModelArgs {
    #[arg(long, global = true)]
    text_model: Option<String>,
    #[arg(long, global = true)]
    vision_model: Option<String>,
    #[arg(long, global = true)]
    image_model: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Plan the next scene state and print it as JSON.
    Plan(PlanArgs),
    /// Print the directive block for a state.
    Render(RenderArgs),
    /// Score an image against an expected state; exits 2 when it fails.
    Verify(VerifyArgs),
    /// Check only the critical elements of an image; exits 2 when one fails.
    QuickVerify(QuickVerifyArgs),
    /// Print a correction prompt for a failed verification.
    Amend(AmendArgs),
    /// Run every scene of a script through the full loop.
    Run(RunArgs),
}

#[derive(Debug, Parser)]
struct PlanArgs {
    #[arg(long)]
    voice_over: String,
    #[arg(long)]
    visual: String,
    #[arg(long)]
    previous: Option<PathBuf>,
    #[arg(long, default_value = "")]
    location: String,
    #[arg(long, default_value = "")]
    characters: String,
    #[arg(long)]
    first: bool,
}

#[derive(Debug, Parser)]
struct RenderArgs {
    #[arg(long)]
    state: PathBuf,
}

#[derive(Debug, Parser)]
struct VerifyArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long)]
    state: PathBuf,
}

#[derive(Debug, Parser)]
struct QuickVerifyArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long = "element", required = true)]
    elements: Vec<String>,
}

#[derive(Debug, Parser)]
struct AmendArgs {
    #[arg(long)]
    prompt: String,
    #[arg(long)]
    verification: PathBuf,
    #[arg(long)]
    state: PathBuf,
}

#[derive(Debug, Parser)]
struct RunArgs {
    #[arg(long)]
    script: PathBuf,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    dryrun: bool,
    #[arg(long)]
    max_corrections: Option<u32>,
    /// Tracker history from an earlier run to continue from.
    #[arg(long)]
    states: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
struct Script {
    scenes: Vec<ScriptScene>,
}

#[derive(Debug, Clone, Deserialize)]
struct ScriptScene {
    group_id: String,
    voice_over: String,
    visual_prompt: String,
    #[serde(default)]
    location_anchor: String,
    #[serde(default)]
    character_descriptions: String,
    #[serde(default)]
    reference_images: Vec<PathBuf>,
    #[serde(default)]
    reset: bool,
}

/// Reads a script and trims every `group_id` so resets and receipts use the
/// same key the tracker does.
fn load_script(path: &Path) -> Result<Script> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed reading {}", path.display()))?;
    let mut script: Script = serde_json::from_str(&raw)
        .with_context(|| format!("invalid script JSON in {}", path.display()))?;
    if script.scenes.is_empty() {
        bail!("script {} has no scenes", path.display());
    }
    for scene in &mut script.scenes {
        scene.group_id = scene.group_id.trim().to_string();
    }
    Ok(script)
}

fn main() {
    init_tracing();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("frameline error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_env("FRAMELINE_LOG")
        .or_else(|_| tracing_subscriber::EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let config = config_with_overrides(EngineConfig::from_env(), &cli.models);
    match cli.command {
        Command::Plan(args) => run_plan(args, &config),
        Command::Render(args) => run_render(args),
        Command::Verify(args) => run_verify(args, &config),
        Command::QuickVerify(args) => run_quick_verify(args, &config),
        Command::Amend(args) => run_amend(args),
        Command::Run(args) => {
            let summary = run_script(&args, config)?;
            print_json(&serde_json::to_value(&summary)?)?;
            Ok(0)
        }
    }
}

fn config_with_overrides(mut config: EngineConfig, models: &ModelArgs) -> EngineConfig {
    if let Some(model) = models.text_model.clone() {
        config.text_model = model;
    }
    if let Some(model) = models.vision_model.clone() {
        config.vision_model = model;
    }
    if let Some(model) = models.image_model.clone() {
        config.image_model = model;
    }
    config
}

/// Stage subcommands never generate images, so they wire the offline generator.
fn stage_engine(config: &EngineConfig) -> Result<ContinuityEngine> {
    ContinuityEngine::from_config(config, EventLog::disabled("frameline-cli"), true)
}

fn run_plan(args: PlanArgs, config: &EngineConfig) -> Result<i32> {
    let previous = args.previous.as_deref().map(read_state).transpose()?;
    let context = GroupContext {
        location_anchor: args.location,
        character_descriptions: args.characters,
        is_first_in_group: args.first || previous.is_none(),
    };
    let engine = stage_engine(config)?;
    let outcome = engine
        .planner()
        .plan(&args.voice_over, &args.visual, previous.as_ref(), &context);
    if let Some(reason) = outcome.degraded_reason() {
        eprintln!("planning degraded: {reason}");
    }
    print_json(&serde_json::to_value(outcome.value())?)?;
    Ok(0)
}

fn run_render(args: RenderArgs) -> Result<i32> {
    let state = read_state(&args.state)?;
    println!("{}", render(&state));
    Ok(0)
}

fn run_verify(args: VerifyArgs, config: &EngineConfig) -> Result<i32> {
    let image = ImageData::from_path(&args.image)?;
    let state = read_state(&args.state)?;
    let outcome = stage_engine(config)?.verifier().verify(&image, &state);
    print_json(&verification_json(&outcome))?;
    Ok(if outcome.value().passed { 0 } else { 2 })
}

fn run_quick_verify(args: QuickVerifyArgs, config: &EngineConfig) -> Result<i32> {
    let image = ImageData::from_path(&args.image)?;
    let outcome = stage_engine(config)?
        .verifier()
        .quick_verify_critical_elements(&image, &args.elements);
    print_json(&quick_json(&outcome))?;
    Ok(if outcome.value().passed { 0 } else { 2 })
}

fn run_amend(args: AmendArgs) -> Result<i32> {
    let raw = fs::read_to_string(&args.verification)
        .with_context(|| format!("failed reading {}", args.verification.display()))?;
    let verification: VerificationResult = serde_json::from_str(&raw)
        .with_context(|| format!("invalid verification JSON in {}", args.verification.display()))?;
    let state = read_state(&args.state)?;
    println!("{}", amend(&args.prompt, &verification, &state));
    Ok(0)
}

fn run_script(args: &RunArgs, mut config: EngineConfig) -> Result<RunSummary> {
    let script = load_script(&args.script)?;
    if let Some(max) = args.max_corrections {
        config.max_corrections = max;
    }

    fs::create_dir_all(&args.out)
        .with_context(|| format!("failed creating {}", args.out.display()))?;
    let session_id = args
        .out
        .file_name()
        .and_then(|value| value.to_str())
        .filter(|value| !value.is_empty())
        .unwrap_or("frameline-session")
        .to_string();
    let events = EventLog::new(args.out.join("events.jsonl"), session_id.clone());
    let engine = ContinuityEngine::from_config(&config, events.clone(), args.dryrun)?;

    let mut tracker = match &args.states {
        Some(path) => StateTracker::restore(read_json::<TrackerExport>(path)?),
        None => StateTracker::new(),
    };
    let mut summary = RunSummary {
        session_id: session_id.clone(),
        started_at: frameline_contracts::events::now_utc_iso(),
        ..RunSummary::default()
    };
    tracing::info!(
        session_id = %session_id,
        scenes = script.scenes.len(),
        dryrun = args.dryrun,
        "session started"
    );
    events.record(
        EventKind::SessionStarted,
        event_payload(json!({
            "out_dir": args.out.to_string_lossy(),
            "scenes": script.scenes.len(),
            "dryrun": args.dryrun,
            "max_corrections": config.max_corrections,
        })),
    )?;

    for (index, scene) in script.scenes.into_iter().enumerate() {
        if scene.reset {
            let dropped = tracker.reset_group(&scene.group_id);
            events.record(
                EventKind::GroupReset,
                event_payload(json!({
                    "group_id": scene.group_id,
                    "dropped": dropped,
                })),
            )?;
        }
        let reference_images = scene
            .reference_images
            .iter()
            .map(|path| ImageData::from_path(path))
            .collect::<Result<Vec<ImageData>>>()?;
        let group_id = scene.group_id.clone();
        let report = engine.run_scene(
            &mut tracker,
            SceneRequest {
                group_id: scene.group_id,
                voice_over: scene.voice_over,
                visual_prompt: scene.visual_prompt,
                location_anchor: scene.location_anchor,
                character_descriptions: scene.character_descriptions,
                reference_images,
            },
        )?;

        let image_path = args.out.join(format!(
            "scene-{:03}-{}.{}",
            index + 1,
            report.state.scene_id,
            report.image.image.extension()
        ));
        fs::write(&image_path, &report.image.image.bytes)
            .with_context(|| format!("failed writing {}", image_path.display()))?;
        let image_sha256 = report.image.image.sha256_hex();
        let receipt = build_receipt(&ReceiptParts {
            group_id: &group_id,
            base_prompt: &report.base_prompt,
            final_prompt: &report.final_prompt,
            state: &report.state,
            verification: report.verification.value(),
            verification_degraded: report.verification.degraded_reason(),
            planning_degraded: report.planning_degraded.as_deref(),
            attempts: report.attempts,
            image_path: &image_path,
            image_sha256: &image_sha256,
            provider_metadata: &report.image.provider_metadata,
        });
        write_receipt(
            &args.out.join(format!("receipt-{}.json", report.state.scene_id)),
            &receipt,
        )?;

        summary.scenes_total += 1;
        if report.verification.value().passed {
            summary.scenes_passed += 1;
        }
        if report.corrected() {
            summary.scenes_corrected += 1;
        }
        if report.planning_degraded.is_some() {
            summary.planning_degraded += 1;
        }
        if report.verification.is_degraded() {
            summary.verification_degraded += 1;
        }
    }

    let states_path = args.out.join("states.json");
    fs::write(&states_path, serde_json::to_string_pretty(&tracker.export())?)
        .with_context(|| format!("failed writing {}", states_path.display()))?;

    summary.finished_at = frameline_contracts::events::now_utc_iso();
    let mut extra = Map::new();
    extra.insert("groups".to_string(), json!(tracker.group_ids()));
    write_summary(&args.out.join("summary.json"), &summary, Some(&extra))?;
    events.record(
        EventKind::SessionFinished,
        event_payload(json!({
            "scenes_total": summary.scenes_total,
            "scenes_passed": summary.scenes_passed,
            "scenes_corrected": summary.scenes_corrected,
        })),
    )?;
    Ok(summary)
}

fn verification_json(outcome: &Outcome<VerificationResult>) -> Value {
    let mut value = serde_json::to_value(outcome.value()).unwrap_or(Value::Null);
    if let Some(obj) = value.as_object_mut() {
        obj.insert(
            "tagged_violations".to_string(),
            json!(outcome.value().tagged_violations()),
        );
        obj.insert("degraded".to_string(), json!(outcome.degraded_reason()));
    }
    value
}

fn quick_json(outcome: &Outcome<QuickVerification>) -> Value {
    let mut value = serde_json::to_value(outcome.value()).unwrap_or(Value::Null);
    if let Some(obj) = value.as_object_mut() {
        obj.insert("degraded".to_string(), json!(outcome.degraded_reason()));
    }
    value
}

fn read_state(path: &Path) -> Result<SceneStateSnapshot> {
    read_json(path)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid JSON in {}", path.display()))
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
