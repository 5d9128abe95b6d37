use std::path::Path;

use anyhow::Context;
use clap::Parser;
use gallery_connect::config::{Command, Config};
use gallery_connect::{AppContext, SaveOutcome};
use gallery_storage_core::{
    decode_image, parse_cloud_drive_spec, BackendKind, StorageConnector, StorageError,
    PARAMETERS_KEY,
};
use gallery_storage_gdrive::GDriveConnector;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();

    match config.command.clone() {
        Command::Save {
            input,
            name,
            parameters,
        } => save(&config, &input, &name, parameters).await,
        Command::Browse {
            kind,
            index,
            tab,
            page,
            info,
        } => browse(&config, &kind, index, &tab, page, info).await,
        Command::Authorize => authorize(&config).await,
    }
}

async fn save(
    config: &Config,
    input: &Path,
    name: &str,
    parameters: Option<String>,
) -> anyhow::Result<()> {
    let bytes = tokio::fs::read(input)
        .await
        .with_context(|| format!("Failed to read {}", input.display()))?;
    let mut artifact = decode_image(&bytes)?;
    if let Some(parameters) = parameters {
        artifact
            .metadata
            .insert(PARAMETERS_KEY.to_string(), parameters);
    }

    let mut ctx = AppContext::new(config.settings());
    match ctx
        .save_image(&artifact.pixels, name, &artifact.metadata)
        .await?
    {
        SaveOutcome::NoConnectors => println!("No remote storage configured; nothing saved"),
        SaveOutcome::Saved(paths) => {
            for (connector, path) in paths {
                println!("{}: {}", connector, path);
            }
        }
    }
    Ok(())
}

async fn browse(
    config: &Config,
    kind: &str,
    index: usize,
    tab: &str,
    page: i64,
    info: Option<usize>,
) -> anyhow::Result<()> {
    let kind = BackendKind::parse(kind)
        .ok_or_else(|| anyhow::anyhow!("Unknown backend kind: {}", kind))?;

    let mut ctx = AppContext::new(config.settings());
    let result = async {
        ctx.select_browser(kind, index).await?;
        let view = ctx.browser().page_for_tab(tab, page).await?;

        println!("{}", view.summary());
        println!("Page {} of {}", view.page, view.max_page);
        for (i, path) in view.paths.iter().enumerate() {
            let image = &view.images[i];
            println!("{:>3}  {}  ({}x{})", i, path, image.width(), image.height());
        }
        if let Some(i) = info {
            match ctx.browser().image_info(i) {
                Some(details) => {
                    println!("\n{}", details.file_name);
                    println!("{}", details.parameters);
                }
                None => println!("\nNo entry {} on this page", i),
            }
        }
        anyhow::Ok(())
    }
    .await;

    ctx.shutdown().await;
    result
}

async fn authorize(config: &Config) -> anyhow::Result<()> {
    let spec = parse_cloud_drive_spec(&config.cloud_drive_options())?.ok_or_else(|| {
        anyhow::anyhow!("Google Drive is not configured (need client secret and save dir)")
    })?;
    let connector = GDriveConnector::new(&spec, config.timeouts()).await?;

    match connector.tokens().get_valid_token().await {
        Ok(_) => info!("Existing Google Drive token is valid"),
        Err(StorageError::AuthorizationRequired(_)) => {
            let url = connector.tokens().authorization_url()?;
            println!("Open this URL, grant access, then paste the code below:\n\n{}\n", url);
            let code = tokio::task::spawn_blocking(|| {
                let mut line = String::new();
                std::io::stdin().read_line(&mut line).map(|_| line)
            })
            .await?
            .context("Failed to read authorization code")?;
            connector.tokens().exchange_code(&code).await?;
        }
        Err(e) => return Err(e.into()),
    }

    connector.bootstrap().await?;
    connector.release().await?;
    println!("Google Drive folder '{}' is ready", spec.folder_name);
    Ok(())
}
