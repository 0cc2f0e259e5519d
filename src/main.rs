//! `nodetool` - run NodeTool workflows from the terminal
//!
//! Thin front end over `nodetool-core`: connects to a worker socket, starts
//! a workflow, streams its events and prints the merged outputs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use console::Style;
use tokio_util::sync::CancellationToken;

use crate::cli::{parse_inputs, Cli, Commands};
use nodetool_core::http::{ApiClient, AssetFetcher, JobCanceller};
use nodetool_core::output::OutputFormatter;
use nodetool_core::{
    compute_signature, ClientConfig, NodetoolClient, SessionState, Value, WorkflowRef,
};

mod cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.version {
        let blue = Style::new().blue();
        println!(
            "{} v{} ({})",
            blue.apply_to("nodetool"),
            env!("CARGO_PKG_VERSION"),
            env!("GIT_HASH")
        );
        return Ok(());
    }

    init_logging(cli.verbose);

    let formatter = OutputFormatter::new();
    let Some(command) = cli.command else {
        bail!("no command given (try `nodetool --help`)");
    };

    match command {
        Commands::Run {
            workflow,
            name,
            inputs,
            timeout,
            download_dir,
        } => {
            let config = load_config(cli.config.as_deref())?;
            let inputs = parse_inputs(&inputs)?;
            let run = RunOptions {
                workflow,
                by_name: name,
                timeout: timeout.map(Duration::from_secs),
                download_dir,
            };
            handle_run(&config, run, inputs, &formatter).await?;
        }

        Commands::Signature { inputs, exclude } => {
            let inputs = parse_inputs(&inputs)?;
            let excluded: Vec<&str> = exclude.iter().map(String::as_str).collect();
            let signature =
                compute_signature(inputs.iter().map(|(k, v)| (k.as_str(), v)), &excluded);
            println!("{}", signature);
        }

        Commands::Workflows => {
            let config = load_config(cli.config.as_deref())?;
            let api = ApiClient::from_config(&config)?;
            let workflows = api
                .list_workflows()
                .await
                .context("Failed to list workflows")?;
            formatter.print_workflows(&workflows);
        }
    }

    Ok(())
}

struct RunOptions {
    workflow: String,
    by_name: bool,
    timeout: Option<Duration>,
    download_dir: Option<PathBuf>,
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_millis()
        .try_init();

    if let Some(home) = dirs::home_dir() {
        nodetool_core::logger::init(
            home.join(".config")
                .join("nodetool")
                .join("logs")
                .join("nodetool.log"),
        );
    }
}

fn load_config(path: Option<&Path>) -> Result<ClientConfig> {
    let config = ClientConfig::load(path).context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;
    log::debug!(
        "using worker {} (api {})",
        config.ws_url.as_deref().unwrap_or_default(),
        config.api_base_url.as_deref().unwrap_or("none")
    );
    Ok(config)
}

async fn handle_run(
    config: &ClientConfig,
    run: RunOptions,
    inputs: BTreeMap<String, Value>,
    formatter: &OutputFormatter,
) -> Result<()> {
    let api = match &config.api_base_url {
        Some(_) => Some(ApiClient::from_config(config)?),
        None => None,
    };

    let workflow = match (run.by_name, &api) {
        (false, _) => WorkflowRef::Id(run.workflow),
        // Prefer an exact id when the HTTP API can resolve the name
        (true, Some(api)) => WorkflowRef::Id(
            api.resolve_workflow_id(&run.workflow)
                .await
                .context("Failed to resolve workflow name")?,
        ),
        (true, None) => WorkflowRef::Name(run.workflow),
    };

    let client = NodetoolClient::new(config.clone())?;
    client
        .connect_default()
        .await
        .with_context(|| format!("Failed to connect to {}", client.endpoint()))?;

    let mut handle = client.execute_workflow(workflow, inputs)?;

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("interrupted, cancelling job");
            interrupt.cancel();
        }
    });
    if let Some(limit) = run.timeout {
        let deadline = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(limit).await;
            if !deadline.is_cancelled() {
                eprintln!("timed out after {:?}, cancelling job", limit);
                deadline.cancel();
            }
        });
    }

    loop {
        tokio::select! {
            event = handle.next_event() => match event {
                Some(event) => formatter.print_event(&event),
                None => break,
            },
            _ = cancel.cancelled() => break,
        }
    }

    let completion = handle.wait_for_completion(&cancel).await;
    formatter.print_completion(&completion);

    // The socket cancel is best-effort; ask the HTTP API as well
    if let (SessionState::Cancelled, Some(api), Some(job_id)) =
        (completion.state, &api, handle.job_id())
    {
        if let Err(e) = api.cancel_job(&job_id).await {
            log::warn!("HTTP cancel for job {} failed: {}", job_id, e);
        }
    }

    if let (Some(dir), SessionState::Completed) = (&run.download_dir, completion.state) {
        let fetcher: &dyn AssetFetcher = match &api {
            Some(api) => api,
            None => bail!("--download-dir needs api_base_url in the configuration"),
        };
        download_assets(fetcher, &completion.outputs, dir).await?;
    }

    client.disconnect().await;

    completion.into_result()?;
    Ok(())
}

async fn download_assets(
    fetcher: &dyn AssetFetcher,
    outputs: &BTreeMap<String, Value>,
    dir: &Path,
) -> Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("Failed to create {}", dir.display()))?;

    let green = Style::new().green();
    for (key, value) in outputs {
        let Some(uri) = value.get("uri").and_then(Value::as_str) else {
            continue;
        };
        if uri.is_empty() {
            continue;
        }
        let bytes = fetcher
            .fetch(uri)
            .await
            .with_context(|| format!("Failed to fetch {}", uri))?;
        let path = dir.join(asset_file_name(key, uri));
        tokio::fs::write(&path, &bytes)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("{} {} ({} bytes)", green.apply_to("saved"), path.display(), bytes.len());
    }
    Ok(())
}

/// `node:output` key plus the extension of the URI's last path segment
fn asset_file_name(key: &str, uri: &str) -> String {
    let stem: String = key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let path = uri.split(['?', '#']).next().unwrap_or_default();
    let last = path.rsplit('/').next().unwrap_or_default();
    match last.rsplit_once('.') {
        Some((_, ext)) if !ext.is_empty() && ext.len() <= 5 && !uri.starts_with("data:") => {
            format!("{}.{}", stem, ext)
        }
        _ => stem,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_asset_file_name() {
        assert_eq!(asset_file_name("out:image", "/assets/1.png"), "out_image.png");
        assert_eq!(
            asset_file_name("out:audio", "http://h/api/assets/a.wav?token=1"),
            "out_audio.wav"
        );
        assert_eq!(asset_file_name("n:o", "/api/assets/abc"), "n_o");
        assert_eq!(asset_file_name("n:o", "data:image/png;base64,AAA"), "n_o");
    }
}
