use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::error::ConfigError;
use super::trigger::TriggerProfile;

/// How decoded records are grouped into output files.
///
/// The receiver historically shipped one build per organization; here all
/// three are runtime choices so a single binary covers every deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputMode {
    /// One file per (board, channel) pair. The default.
    PerChannel,
    /// One file per board.
    PerBoard,
    /// A single file for the whole stream.
    Single,
}

/// Structure representing the application configuration. Contains the server
/// endpoint, run naming, and all output policy switches.
/// Configs are serializable and deserializable to YAML using serde and serde_yaml
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server_address: String,
    pub server_port: u16,
    pub run_name: String,
    pub output_path: PathBuf,
    pub folder_per_run: bool,
    pub output_mode: OutputMode,
    pub geb_header_enabled: bool,
    pub geb_type: i32,
    pub max_chunk_bytes: u64,
    pub single_shot: bool,
    pub filter_fifo_headers: bool,
    pub diagnostics_enabled: bool,
    pub trigger_profile: TriggerProfile,
    pub summary_interval_secs: u64,
}

impl Default for Config {
    /// Generate a new Config object. Endpoint and run fields will be empty/invalid
    fn default() -> Self {
        Self {
            server_address: String::from(""),
            server_port: 9001,
            run_name: String::from(""),
            output_path: PathBuf::from("None"),
            folder_per_run: true,
            output_mode: OutputMode::PerChannel,
            geb_header_enabled: true,
            geb_type: 14,
            max_chunk_bytes: 2_000_000_000,
            single_shot: false,
            filter_fifo_headers: false,
            diagnostics_enabled: false,
            trigger_profile: TriggerProfile::RevA,
            summary_interval_secs: 5,
        }
    }
}

impl Config {
    /// Read the configuration in a YAML file
    /// Returns a Config if successful
    pub fn read_config_file(config_path: &Path) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            return Err(ConfigError::BadFilePath(config_path.to_path_buf()));
        }

        let yaml_str = std::fs::read_to_string(config_path)?;

        Ok(serde_yaml::from_str::<Self>(&yaml_str)?)
    }

    /// The `host:port` string handed to the session layer
    pub fn server_endpoint(&self) -> String {
        format!("{}:{}", self.server_address, self.server_port)
    }

    /// The directory output files are created in. With `folder_per_run` each
    /// run gets its own subdirectory named after the run.
    pub fn run_directory(&self) -> PathBuf {
        if self.folder_per_run {
            self.output_path.join(&self.run_name)
        } else {
            self.output_path.clone()
        }
    }

    pub fn is_server_valid(&self) -> bool {
        !self.server_address.is_empty() && self.server_port != 0
    }

    pub fn is_run_name_valid(&self) -> bool {
        !self.run_name.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yaml_round_trip() {
        let mut config = Config::default();
        config.server_address = String::from("192.168.203.211");
        config.run_name = String::from("data_run_001");
        config.output_mode = OutputMode::PerBoard;
        config.trigger_profile = TriggerProfile::RevB;

        let yaml_str = serde_yaml::to_string(&config).unwrap();
        let read_back = serde_yaml::from_str::<Config>(&yaml_str).unwrap();
        assert_eq!(read_back.server_address, config.server_address);
        assert_eq!(read_back.server_port, 9001);
        assert_eq!(read_back.output_mode, OutputMode::PerBoard);
        assert_eq!(read_back.trigger_profile, TriggerProfile::RevB);
        assert_eq!(read_back.max_chunk_bytes, 2_000_000_000);
    }

    #[test]
    fn test_missing_config_file() {
        let result = Config::read_config_file(Path::new("/does/not/exist.yml"));
        assert!(matches!(result, Err(ConfigError::BadFilePath(_))));
    }

    #[test]
    fn test_run_directory() {
        let mut config = Config::default();
        config.output_path = PathBuf::from("/data");
        config.run_name = String::from("data_run_001");
        assert_eq!(
            config.run_directory(),
            PathBuf::from("/data/data_run_001")
        );
        config.folder_per_run = false;
        assert_eq!(config.run_directory(), PathBuf::from("/data"));
    }
}
