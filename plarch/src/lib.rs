pub mod event_loop;
pub mod guard;
pub mod rtc;
pub mod socket;
pub mod tasks;

pub fn start_logging() {
    start_logging_filter(vec![]);
}

pub fn start_logging_filter(filters: Vec<&str>) {
    start_logging_filter_level(filters, log::LevelFilter::Info);
}

pub fn start_logging_filter_level(filters: Vec<&str>, level: log::LevelFilter) {
    let mut logger = env_logger::Builder::new();
    if filters.is_empty() {
        logger.filter_level(level);
    } else {
        for filter in filters {
            logger.filter_module(filter, level);
        }
    }
    logger.parse_env("RUST_LOG");
    if logger.try_init().is_err() {
        log::trace!("Logger probably already initialized");
    }
}
