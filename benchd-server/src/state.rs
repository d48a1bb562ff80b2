use std::sync::Arc;

use benchd_core::Bench;

use crate::config::ServerConfig;
use crate::layouts::LayoutStore;

#[derive(Clone)]
pub struct AppState {
    pub bench: Arc<Bench>,
    pub layouts: Arc<LayoutStore>,
    pub config: Arc<ServerConfig>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish()
    }
}
