use clap::Parser;
use piiscan::detection::chunked::{RunnerSettings, default_worker_count};
use piiscan::detection::{DetectionService, DetectorSet, DetectorSource};
use piiscan::detectors::factory::{DetectorRegistry, DetectorSettings, default_registry};
use piiscan::policy::store::PolicyStoreAdapter;
use piiscan::{api, config, logging, policy};
use std::sync::Arc;
use tokio::net::TcpListener;

/// PII detection server.
#[derive(Parser)]
#[command(name = "piiscan", about = "Multi-detector PII scanning service")]
struct Cli {
    /// Port to listen on (overrides SERVER_PORT).
    #[arg(long)]
    port: Option<u16>,
    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    config::init_config();
    logging::init_tracing(cli.debug);
    let config = config::get_config();

    if let Some(key) = &config.ml_api_key {
        let masked = key.get(..3).unwrap_or("***");
        tracing::debug!(key_prefix = masked, "Model API key configured");
    }

    let defaults = policy::defaults::load(&config.config_dir).unwrap_or_else(|error| {
        tracing::error!(error = %error, "Failed to load on-disk policy; refusing to start");
        std::process::exit(1);
    });

    let registry = default_registry().unwrap_or_else(|error| {
        tracing::error!(error = %error, "Failed to initialize detector registry");
        std::process::exit(1);
    });

    let detectors = build_detector_set(&registry, &defaults);

    let adapter = PolicyStoreAdapter::from_config(config, defaults.baseline.clone())
        .unwrap_or_else(|error| {
            tracing::error!(error = %error, "Failed to initialize policy store client");
            std::process::exit(1);
        });

    let runner_settings = RunnerSettings {
        long_text_threshold: defaults.settings.long_text_threshold,
        chunk_size_tokens: defaults.settings.chunk_size_tokens,
        chunk_overlap_tokens: defaults.settings.chunk_overlap_tokens,
        max_workers: defaults.settings.max_workers.unwrap_or_else(default_worker_count),
    };

    let service = DetectionService::new(
        detectors,
        adapter,
        runner_settings,
        defaults.settings.max_content_bytes,
    );
    if let Err(error) = service.load_detectors().await {
        tracing::error!(error = %error, "Detector load failed; refusing to start");
        std::process::exit(1);
    }

    let app = api::create_router(Arc::new(service), config.enable_reflection);
    let (listener, port) = bind_listener(cli.port).await.expect("Failed to bind listener");
    tracing::info!("Listening on http://0.0.0.0:{}", port);
    axum::serve(listener, app).await.unwrap();
}

/// Instantiate every known detector, whatever the startup toggles say.
///
/// The on-disk enabled flags seed the policy snapshot only; an instance of
/// each backend must exist so a runtime policy change can enable it without
/// a restart.
fn build_detector_set(
    registry: &DetectorRegistry,
    defaults: &policy::defaults::PolicyDefaults,
) -> DetectorSet {
    let config = config::get_config();

    let mut model_ids: Vec<String> = match &config.multi_detector_models {
        Some(ids) => ids.clone(),
        None => defaults
            .models
            .iter()
            .map(|model| model.model_id.clone())
            .collect(),
    };
    if !config.multi_detector_enabled {
        model_ids.truncate(1);
    }

    let mut detectors = DetectorSet::default();
    for model_id in &model_ids {
        let mut settings = DetectorSettings::for_model(model_id.clone());
        if let Some(model) = defaults
            .models
            .iter()
            .find(|model| &model.model_id == model_id)
        {
            settings.max_length = model.max_length;
            settings.threshold = model.threshold;
        }
        let detector = registry.create(model_id, &settings).unwrap_or_else(|error| {
            tracing::error!(model_id = %model_id, error = %error, "Unregistered detector at startup");
            std::process::exit(1);
        });
        place(&mut detectors, detector);
    }

    for fallback in ["gliner-pii", "regex-detector", "rule-engine"] {
        let missing = match determine_slot(fallback) {
            DetectorSource::Ml => detectors.ml.is_none(),
            DetectorSource::Regex => detectors.regex.is_none(),
            DetectorSource::Rule => detectors.rule.is_none(),
            DetectorSource::Unknown => false,
        };
        if missing {
            let detector = registry
                .create(fallback, &DetectorSettings::for_model(fallback))
                .unwrap_or_else(|error| {
                    tracing::error!(model_id = fallback, error = %error, "Unregistered detector at startup");
                    std::process::exit(1);
                });
            place(&mut detectors, detector);
        }
    }

    detectors
}

fn determine_slot(model_id: &str) -> DetectorSource {
    let lowered = model_id.to_lowercase();
    if lowered.contains("regex") {
        DetectorSource::Regex
    } else if lowered.contains("rule") {
        DetectorSource::Rule
    } else {
        DetectorSource::Ml
    }
}

fn place(detectors: &mut DetectorSet, detector: Arc<dyn piiscan::detectors::Detector>) {
    let model_id = detector.model_id().to_string();
    let slot = match detector.source() {
        DetectorSource::Ml => &mut detectors.ml,
        DetectorSource::Regex => &mut detectors.regex,
        DetectorSource::Rule => &mut detectors.rule,
        DetectorSource::Unknown => {
            tracing::warn!(model_id = %model_id, "Detector reports unknown source; skipping");
            return;
        }
    };
    if slot.is_some() {
        tracing::warn!(model_id = %model_id, "Detector slot already filled; skipping duplicate");
        return;
    }
    tracing::info!(model_id = %model_id, "Detector instantiated");
    *slot = Some(detector);
}

async fn bind_listener(cli_port: Option<u16>) -> Result<(TcpListener, u16), std::io::Error> {
    use std::net::Ipv4Addr;

    let config = config::get_config();
    if let Some(port) = cli_port.or(config.server_port) {
        return TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
            .await
            .map(|listener| (listener, port));
    }

    const PORT_RANGE: std::ops::RangeInclusive<u16> = 50051..=50060;
    for port in PORT_RANGE {
        match TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await {
            Ok(listener) => {
                tracing::debug!(port, "Bound server port");
                return Ok((listener, port));
            }
            Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
                tracing::debug!(port, "Port already in use; trying next");
                continue;
            }
            Err(err) => return Err(err),
        }
    }

    Err(std::io::Error::new(
        std::io::ErrorKind::AddrNotAvailable,
        "No available port found in range 50051-50060",
    ))
}
