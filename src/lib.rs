use header::HeapObjectHeader;
use page::LargePage;

macro_rules! logln_if {
    ($cond: expr, $($t:tt)*) => {
        if $cond {
            log::info!($($t)*);
        }
    };
}

pub mod gc_info_table;
pub mod gcref;
pub mod header;
pub mod heap;
pub mod internal;
pub mod liveness_broker;
pub mod logger;
pub mod marker;
pub mod marking;
pub mod marking_state;
pub mod marking_worklists;
pub mod page;
pub mod visitor;
pub mod worklist;


pub struct GCPlatform;

impl GCPlatform {
    /// Initializes global state for GC: the type info table and, if enabled, logging.
    pub fn initialize() {
        let _ = logger::try_init();
        gc_info_table::GCInfoTable::global();
    }
}

/// Configuration for the marking driver.
#[derive(Clone, Debug)]
pub struct Config {
    /// Number of tasks draining the marking worklist in parallel
    pub marking_tasks: usize,
    /// Objects traced by one incremental step
    pub step_size: usize,
    /// Enables the per episode summary
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            marking_tasks: 1,
            step_size: 1024,
            verbose: false,
        }
    }
}

impl Config {
    /// Default configuration overridden by `COMET_MARKING_TASKS`, `COMET_STEP_SIZE` and
    /// `COMET_VERBOSE`. Unparsable values are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(tasks) = env_parse::<usize>("COMET_MARKING_TASKS") {
            config.marking_tasks = tasks.max(1);
        }
        if let Some(step_size) = env_parse::<usize>("COMET_STEP_SIZE") {
            config.step_size = step_size.max(1);
        }
        if let Some(verbose) = env_parse::<bool>("COMET_VERBOSE") {
            config.verbose = verbose;
        }
        config
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let value = std::env::var(name).ok()?;
    match value.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("ignoring invalid value {:?} for {}", value, name);
            None
        }
    }
}

/// Returns GC allocation size of object, header included.
pub fn gc_size(ptr: *const HeapObjectHeader) -> usize {
    unsafe {
        let size = (*ptr).get_size();
        if size == 0 {
            (*LargePage::from_object_header(ptr)).payload_size()
        } else {
            size
        }
    }
}
