use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::os::fd::{FromRawFd, OwnedFd};
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::{
    backend::{media_types, Descriptor, ImageConfig, OciLayoutWriter, OciManifest, Transports},
    cli::commands::{CopyCommand, InspectCommand, InspectFormat, InspectOutput, ProxyCommand},
    client::{ImageProxy, ProxyCommandConfig},
    config::{ConfigArgs, ProxyConfig},
    framing::Connection,
    server::ProxyServer,
};

/// Serve one connection on the socket inherited at `--sockfd`.
pub async fn handle_proxy(cmd: &ProxyCommand) -> Result<()> {
    let config = ProxyConfig::load(&cmd.config).context("Failed to load configuration")?;
    if cmd.sockfd < 0 {
        bail!("invalid socket descriptor {}", cmd.sockfd);
    }

    // SAFETY: the parent process handed us this descriptor; nothing else in
    // this process refers to it.
    let fd = unsafe { OwnedFd::from_raw_fd(cmd.sockfd) };
    let conn = Connection::from_owned_fd(fd)
        .with_context(|| format!("Failed to adopt socket descriptor {}", cmd.sockfd))?;

    let transports = Transports::with_defaults(&config);
    info!(
        platform = %config.platform,
        verify_digests = config.verify_digests,
        transports = ?transports.names(),
        "starting image proxy"
    );
    ProxyServer::new(Arc::new(transports), &config)
        .serve(conn)
        .await
        .context("Proxy connection failed")?;
    Ok(())
}

/// Drive a spawned proxy to print one image.
pub async fn handle_inspect(cmd: &InspectCommand) -> Result<()> {
    let proxy = spawn_proxy(cmd.proxy_program.as_deref(), &cmd.config).await?;
    let image = proxy
        .open_image(&cmd.reference)
        .await
        .with_context(|| format!("Failed to open {}", cmd.reference))?;

    let output = match cmd.format() {
        InspectFormat::Raw => proxy.get_manifest(image).await?.1,
        InspectFormat::Config => proxy.get_config(image).await?,
        InspectFormat::Json => {
            let (digest, bytes) = proxy.get_manifest(image).await?;
            let manifest: OciManifest =
                serde_json::from_slice(&bytes).context("Failed to parse manifest")?;
            let config: ImageConfig = serde_json::from_slice(&proxy.get_config(image).await?)
                .context("Failed to parse image config")?;
            InspectOutput::new(&digest, &manifest, config).to_json()?
        }
    };
    let mut stdout = tokio::io::stdout();
    stdout.write_all(&output).await?;
    stdout.flush().await?;

    proxy.close_image(image).await?;
    proxy.shutdown().await?;
    Ok(())
}

/// Copy an image into an OCI layout, reading it through a spawned proxy.
pub async fn handle_copy(cmd: &CopyCommand) -> Result<()> {
    let destination = cmd.destination.strip_prefix("oci:").with_context(|| {
        format!(
            "Unsupported destination {}: only oci:<dir>[:<tag>] can be written",
            cmd.destination
        )
    })?;

    let proxy = spawn_proxy(cmd.proxy_program.as_deref(), &cmd.config).await?;
    let image = proxy
        .open_image(&cmd.source)
        .await
        .with_context(|| format!("Failed to open {}", cmd.source))?;
    let (digest, manifest_bytes) = proxy.get_manifest(image).await?;
    let manifest: OciManifest =
        serde_json::from_slice(&manifest_bytes).context("Failed to parse manifest")?;
    let writer = OciLayoutWriter::create(destination)
        .await
        .with_context(|| format!("Failed to prepare {}", cmd.destination))?;

    let report = |line: String| {
        if !cmd.quiet {
            println!("{line}");
        }
    };
    report("Getting image source signatures".to_owned());
    for layer in &manifest.layers {
        if writer.has_blob(&layer.digest).await? {
            report(format!("Copying blob {} skipped: already exists", layer.digest));
            continue;
        }
        report(format!("Copying blob {}", layer.digest));
        let sink = writer.blob_sink(&layer.digest).await?;
        let size = i64::try_from(layer.size).unwrap_or(-1);
        let (copied, sink) = proxy
            .copy_blob(image, &layer.digest, size, sink)
            .await
            .with_context(|| format!("Failed to copy blob {}", layer.digest))?;
        sink.commit()
            .await
            .with_context(|| format!("Failed to store blob {}", layer.digest))?;
        debug!(digest = %layer.digest, bytes = copied, "copied blob");
    }

    report(format!("Copying config {}", manifest.config.digest));
    let config = proxy.get_config(image).await?;
    writer
        .put_blob(&manifest.config.digest, &config)
        .await
        .context("Failed to store config")?;

    report("Writing manifest to image destination".to_owned());
    writer
        .put_blob(&digest, &manifest_bytes)
        .await
        .context("Failed to store manifest")?;
    writer
        .add_manifest(Descriptor {
            media_type: manifest
                .media_type
                .clone()
                .unwrap_or_else(|| media_types::OCI_MANIFEST.to_owned()),
            digest: digest.clone(),
            size: manifest_bytes.len() as u64,
            platform: None,
            annotations: HashMap::new(),
        })
        .await
        .context("Failed to update index.json")?;

    if let Some(path) = &cmd.digestfile {
        tokio::fs::write(path, &digest)
            .await
            .with_context(|| format!("Failed to write digest to {}", path.display()))?;
    }
    info!(source = %cmd.source, destination = %cmd.destination, %digest, "image copied");

    proxy.close_image(image).await?;
    proxy.shutdown().await?;
    Ok(())
}

async fn spawn_proxy(program: Option<&Path>, config: &ConfigArgs) -> Result<ImageProxy> {
    let program = match program {
        Some(path) => ProxyCommandConfig::new(path),
        None => ProxyCommandConfig::current_exe()?,
    };
    let program = forward_config_args(program, config);
    debug!(program = %program.program.display(), "spawning proxy");
    ImageProxy::spawn(program)
        .await
        .context("Failed to start image proxy")
}

/// Pass this process's configuration on to the proxy it spawns.
fn forward_config_args(mut program: ProxyCommandConfig, args: &ConfigArgs) -> ProxyCommandConfig {
    if let Some(path) = &args.config {
        program = program.arg("--config").arg(path);
    }
    if let Some(os) = &args.override_os {
        program = program.arg("--override-os").arg(os);
    }
    if let Some(arch) = &args.override_arch {
        program = program.arg("--override-arch").arg(arch);
    }
    if let Some(variant) = &args.override_variant {
        program = program.arg("--override-variant").arg(variant);
    }
    if args.no_verify_digests {
        program = program.arg("--no-verify-digests");
    }
    program
}
