use clap::{Args, Parser};
use config::Config;
use executor::config::get_loader;
use executor::{Executor, VersionedCache};
use policy_store::config::get_store;
use policy_store::negative_cache::NegativeCache;
use policy_store::{CanaryRouter, PolicyRef, RefreshLoop};
use shared::admin_service::AdminService;
use shared::http::run_http_service;
use signing::{ArtifactSigner, ArtifactVerifier};
use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;

mod config;
mod observability;

type BoxError = Box<dyn Error + Send + Sync>;

#[derive(Parser)]
#[command(name = "apx", about = "Policy control plane for the apx gateway")]
enum CliCommand {
    /// Run the worker: refresh loop, artifact cache and admin listener.
    Serve(ConfigArgs),
    /// Write a development key pair.
    Keygen {
        #[arg(long, default_value = "keys")]
        out_dir: PathBuf,
    },
    /// Sign an artifact and write its `.sig` sidecar.
    Sign {
        #[command(flatten)]
        config: ConfigArgs,
        #[arg(long)]
        artifact: PathBuf,
        /// Embed metadata for this version in the sidecar.
        #[arg(long)]
        version: Option<String>,
        #[arg(long, requires = "version")]
        policy_id: Option<String>,
    },
    /// Verify a local artifact against its sidecar.
    Verify {
        #[command(flatten)]
        config: ConfigArgs,
        #[arg(long)]
        artifact: PathBuf,
        #[arg(long)]
        version: String,
        #[arg(long)]
        hash: Option<String>,
    },
    /// Set the canary percentage of a policy version.
    Canary {
        #[command(flatten)]
        config: ConfigArgs,
        /// `name@version`
        #[arg(long)]
        policy_ref: PolicyRef,
        #[arg(long, allow_negative_numbers = true)]
        percentage: i32,
    },
    /// Send a policy's canary back to 0% and its stable version to 100%.
    Rollback {
        #[command(flatten)]
        config: ConfigArgs,
        #[arg(long)]
        policy: String,
    },
}

#[derive(Args)]
struct ConfigArgs {
    #[arg(long, default_value = "apx.yaml")]
    config: PathBuf,
}

#[derive(thiserror::Error, Debug)]
enum ServeError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn main() -> Result<(), BoxError> {
    let cli = CliCommand::parse();

    let config_path = match &cli {
        CliCommand::Keygen { out_dir } => {
            let (private, public) = signing::generate_dev_key_pair(out_dir)?;
            println!("wrote {} and {}", private.display(), public.display());
            return Ok(());
        }
        CliCommand::Serve(args)
        | CliCommand::Sign { config: args, .. }
        | CliCommand::Verify { config: args, .. }
        | CliCommand::Canary { config: args, .. }
        | CliCommand::Rollback { config: args, .. } => args.config.clone(),
    };
    let config = Config::from_file(&config_path)?;

    let _sentry = observability::init_logging(&config.logging)?;
    if let Some(metrics) = &config.metrics {
        observability::init_metrics(metrics)?;
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    rt.block_on(run(cli, config))
}

async fn run(cli: CliCommand, config: Config) -> Result<(), BoxError> {
    match cli {
        CliCommand::Serve(_) => serve(config).await,
        CliCommand::Sign {
            artifact,
            version,
            policy_id,
            ..
        } => sign(&config, &artifact, version, policy_id).await,
        CliCommand::Verify {
            artifact,
            version,
            hash,
            ..
        } => {
            let verifier = ArtifactVerifier::from_config(&config.verification).await?;
            let verified = verifier
                .verify_file(&artifact, &version, hash.as_deref())
                .await?;
            println!(
                "{}: ok (signed: {})",
                artifact.display(),
                verified.signed
            );
            Ok(())
        }
        CliCommand::Canary {
            policy_ref,
            percentage,
            ..
        } => {
            let router = load_router(&config).await?;
            router
                .update_canary_percentage(&policy_ref, percentage)
                .await?;
            println!("{policy_ref} is now at {percentage}%");
            Ok(())
        }
        CliCommand::Rollback { policy, .. } => {
            let router = load_router(&config).await?;
            let outcome = router.rollback(&policy).await?;
            println!("{} rolled back to 0%", outcome.canary);
            match (&outcome.stable, outcome.stable_restored) {
                (Some(stable), true) => println!("{stable} restored to 100%"),
                (Some(stable), false) => println!("warning: could not restore {stable} to 100%"),
                (None, _) => println!("warning: no stable version to restore"),
            }
            Ok(())
        }
        CliCommand::Keygen { .. } => Ok(()),
    }
}

async fn sign(
    config: &Config,
    artifact: &Path,
    version: Option<String>,
    policy_id: Option<String>,
) -> Result<(), BoxError> {
    let signer = ArtifactSigner::from_config(&config.signing).await?;
    let sidecar = match version {
        Some(version) => {
            let policy_id = match policy_id {
                Some(policy_id) => policy_id,
                None => artifact
                    .file_stem()
                    .map(|stem| stem.to_string_lossy().into_owned())
                    .unwrap_or_default(),
            };
            signer
                .sign_file_with_metadata(artifact, &version, &policy_id)
                .await?
        }
        None => signer.sign_file(artifact).await?,
    };
    println!("wrote {}", sidecar.display());
    Ok(())
}

async fn load_router(config: &Config) -> Result<CanaryRouter, BoxError> {
    let router = CanaryRouter::new(
        get_store(&config.policy_store),
        NegativeCache::new(config.refresh.negative_cache_ttl()),
    );
    router.load_from_store().await?;
    Ok(router)
}

async fn serve(config: Config) -> Result<(), BoxError> {
    let router = Arc::new(CanaryRouter::new(
        get_store(&config.policy_store),
        NegativeCache::new(config.refresh.negative_cache_ttl()),
    ));
    let refresh = RefreshLoop::spawn(router.clone(), config.refresh.clone());

    let verifier = Arc::new(ArtifactVerifier::from_config(&config.verification).await?);
    let mut executor = Executor::new(verifier, VersionedCache::new(config.cache.ttl()))
        .with_resolver(router.clone())
        .with_fetch_timeout(config.cache.fetch_timeout());
    match &config.object_store {
        Some(object_store) => executor = executor.with_loader(get_loader(object_store).await?),
        None => tracing::warn!("no object store configured, cache misses will fail"),
    }
    let executor = Arc::new(executor);
    let janitor = executor.spawn_eviction_task(config.cache.eviction_interval());

    for policy in &config.preload {
        if let Err(err) = executor
            .preload(&policy.name, &policy.version, policy.previous.as_deref())
            .await
        {
            tracing::error!(
                policy = %policy.name,
                version = %policy.version,
                error = %err,
                "failed to preload policy"
            );
        }
    }

    let ready_router = router.clone();
    let status_executor = executor.clone();
    let status_router = router.clone();
    let admin = AdminService::<_, _, ServeError>::new(
        move || ready_router.is_ready(),
        move || {
            serde_json::json!({
                "ready": status_router.is_ready(),
                "policies": status_router.len(),
                "cache": status_executor.stats(),
            })
        },
    );

    let shutdown = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "could not listen for shutdown signal");
        }
        tracing::info!("shutting down");
    };
    let served = run_http_service(
        &config.admin_listener.host,
        config.admin_listener.port,
        admin,
        shutdown,
    )
    .await;

    janitor.abort();
    refresh.shutdown().await;
    served?;
    Ok(())
}
