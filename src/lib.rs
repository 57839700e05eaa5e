pub mod renderer;
pub mod scene;
pub mod settings;

pub use renderer::{CustomView, FrameStats, RecordingDevice, RenderDevice, SceneBatchCollector, WorkQueue};
pub use settings::RenderSettings;

/// Route `log` output through `env_logger`, defaulting to `Info`. Safe to call more than once.
pub fn init_logging() {
    let _ = env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .try_init();
}
