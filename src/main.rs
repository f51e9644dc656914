use ever_index_worker::{
    config::IndexWorkerConfig,
    engine_traits::{ChainReader, InsertManager, KvWriter},
    event_processor::EventProcessor,
    interfaces::Detectors,
    scanner::StateScanner,
    scheduler::IndexScheduler,
    smc::SmcExecutor,
    stubs::{StubChainReader, StubInsertManager, StubKvStore},
    trace::{inserter::TraceInserter, run_trace_emulation, TraceEmulator},
};

use ever_block::Result;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

enum WorkerMode {
    Index,
    Scan { mc_seqno: u32 },
}

fn init_logger(log_config_path: Option<&str>) {
    if let Some(path) = log_config_path {
        if let Err(err) = log4rs::init_file(path, Default::default()) {
            println!("Error while initializing log by {}: {}", path, err);
        } else {
            return;
        }
    }

    let level = log::LevelFilter::Info;
    let stdout = log4rs::append::console::ConsoleAppender::builder()
        .target(log4rs::append::console::Target::Stdout)
        .build();

    let config = log4rs::config::Config::builder()
        .appender(
            log4rs::config::Appender::builder()
                .filter(Box::new(log4rs::filter::threshold::ThresholdFilter::new(level)))
                .build("stdout", Box::new(stdout)),
        )
        .build(
            log4rs::config::Root::builder()
                .appender("stdout")
                .build(level),
        );
    match config {
        Ok(config) => {
            if let Err(e) = log4rs::init_config(config) {
                println!("Error init log: {}", e);
            }
        }
        Err(e) => println!("Error init log: {}", e),
    }
}

fn log_version() {
    log::info!(
        "Execute {:?}\nCOMMIT_ID: {:?}\nBUILD_DATE: {:?}\nGIT_BRANCH: {:?}\n",
        std::option_env!("CARGO_PKG_VERSION"),
        std::option_env!("BUILD_GIT_COMMIT_ID"),
        std::option_env!("BUILD_TIME"),
        std::option_env!("BUILD_GIT_BRANCH"),
    );
}

fn parse_args() -> (String, WorkerMode) {
    let mut config_path = "config.json".to_string();
    let mut mode = WorkerMode::Index;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => match args.next() {
                Some(path) => config_path = path,
                None => {
                    eprintln!("'--config' requires a path");
                    std::process::exit(2);
                }
            },
            "--scan" => match args.next().and_then(|seqno| seqno.parse().ok()) {
                Some(mc_seqno) => mode = WorkerMode::Scan { mc_seqno },
                None => {
                    eprintln!("'--scan' requires a masterchain seqno");
                    std::process::exit(2);
                }
            },
            unknown => {
                eprintln!("unknown option '{}'", unknown);
                std::process::exit(2);
            }
        }
    }
    (config_path, mode)
}

/// The external collaborators of this worker live in separate crates. Until a
/// real backend is linked in, the daemon runs against in-memory stubs, which
/// is enough for local pipelines and tests.
fn create_collaborators(
) -> (Arc<dyn ChainReader>, Arc<dyn InsertManager>, Arc<dyn KvWriter>) {
    log::warn!("no storage backend configured, using in-memory stub collaborators");
    (
        Arc::new(StubChainReader::default()),
        Arc::new(StubInsertManager::default()),
        Arc::new(StubKvStore::default()),
    )
}

async fn start_worker(config: IndexWorkerConfig, mode: WorkerMode) -> Result<()> {
    let (chain_reader, insert_manager, kv_writer) = create_collaborators();

    let executor = Arc::new(SmcExecutor::new(0, config.smc.getter_gas_limit));
    let detectors = Arc::new(Detectors::new(
        executor,
        insert_manager.clone(),
        config.smc.entity_cache_limit,
    ));

    let stop = Arc::new(AtomicBool::new(false));
    let stop_on_signal = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("stop signal received");
            stop_on_signal.store(true, Ordering::Relaxed);
        }
    });

    match mode {
        WorkerMode::Scan { mc_seqno } => {
            let scanner = StateScanner::new(
                chain_reader,
                insert_manager,
                detectors,
                config.scanner.clone(),
            );
            scanner.run(mc_seqno, stop).await
        }
        WorkerMode::Index => {
            if config.kv_uri.is_some() {
                let emulator = Arc::new(TraceEmulator::new(config.trace.depth_limit));
                let inserter = Arc::new(TraceInserter::new(kv_writer));
                let trace_reader = chain_reader.clone();
                let trace_detectors = detectors.clone();
                let trace_stop = stop.clone();
                tokio::spawn(async move {
                    if let Err(err) = run_trace_emulation(
                        trace_reader, emulator, trace_detectors, inserter, trace_stop,
                    )
                    .await
                    {
                        log::error!("trace emulation stopped: {}", err);
                    }
                });
            }

            let event_processor = Arc::new(EventProcessor::new(detectors));
            let scheduler = IndexScheduler::new(
                chain_reader,
                insert_manager,
                event_processor,
                config.scheduler.clone(),
                config.last_known_seqno,
            );
            scheduler.run_indexing(stop).await
        }
    }
}

fn main() {
    let (config_path, mode) = parse_args();

    let config = match IndexWorkerConfig::from_file(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Can't load config {}: {:?}", config_path, e);
            std::process::exit(2);
        }
    };

    init_logger(config.log_config_path.as_deref());
    log_version();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.threads)
        .enable_all()
        .thread_stack_size(8 * 1024 * 1024)
        .build()
        .expect("Can't create tokio runtime");

    runtime.block_on(async move {
        if let Err(e) = start_worker(config, mode).await {
            log::error!("Can't start indexing worker: {:?}", e);
            std::process::exit(1);
        }
    });
}
