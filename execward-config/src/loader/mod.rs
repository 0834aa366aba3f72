pub mod layers;

mod manager;
mod merge;

pub use layers::{ConfigLayerEntry, ConfigLayerSource, ConfigLayerStack};
pub use manager::ConfigManager;
pub use merge::merge_toml_values;
