pub mod automation;
pub mod job;
pub mod run;
pub mod serve;

use anyhow::Context;
use catalyst_core::{CatalystDb, ServiceConfig};

pub(crate) fn open_db(config: &ServiceConfig) -> anyhow::Result<CatalystDb> {
    CatalystDb::open(&config.db_path)
        .with_context(|| format!("opening database {}", config.db_path.display()))
}
