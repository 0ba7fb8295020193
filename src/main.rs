use flowpool::{
    log, parse_args, parse_config, set_debug, set_log_file, signals, ActivityRegistry, Collaborators,
    CommandExecutor, CommandProtector, HypervisorCheck, LogStats, SpoolTaskSource, TaskCounters,
    WorkerPool, PROGRAM_NAME, PROGRAM_VERSION,
};
use std::process;
use std::sync::Arc;

fn fail(message: &str) -> ! {
    eprintln!("Error: {}", message);
    let _ = log(message);
    process::exit(1);
}

fn main() {
    let args = parse_args();
    if let Some(log_file) = &args.log_file {
        if let Err(e) = set_log_file(log_file) {
            fail(&format!("cannot use log file {}: {}", log_file, e));
        }
    }
    set_debug(args.debug);

    let config = parse_config(&args.config_file)
        .unwrap_or_else(|e| fail(&format!("{}: {}", args.config_file, e)));

    let _ = log(&format!(
        "{} {} starting: domain {}, tasklist {}, {} worker(s)",
        PROGRAM_NAME, PROGRAM_VERSION, config.domain, config.tasklist, config.number_of_workers
    ));

    let registry = ActivityRegistry::load(&config.activities_path).unwrap_or_else(|e| fail(&e.to_string()));
    let source = SpoolTaskSource::open(config.queue_dir(), config.poll_timeout()).unwrap_or_else(|e| {
        fail(&format!("cannot open queue directory {}: {}", config.queue_dir().display(), e))
    });

    let counters = Arc::new(TaskCounters::default());
    let collaborators = Collaborators {
        source: Arc::new(source),
        executor: Arc::new(CommandExecutor::new(registry)),
        stats: Box::new(LogStats::new(&config, Arc::clone(&counters))),
        host: Box::new(HypervisorCheck::new(&config.hypervisor_uuid_path)),
        protector: Box::new(
            CommandProtector::new(config.protection_command.clone()).with_timeout(config.protection_timeout()),
        ),
        counters,
    };

    let pool = Arc::new(WorkerPool::build(&config, collaborators).unwrap_or_else(|e| fail(&e.to_string())));

    if let Err(e) = signals::spawn_watcher(Arc::clone(&pool)) {
        fail(&format!("cannot install signal handlers: {}", e));
    }

    if let Err(e) = pool.start() {
        fail(&e.to_string());
    }

    let _ = log("All workers stopped, exiting");
}
