// Copyright (c) 2025 Saorsa Labs Limited
//
// This file is part of the Saorsa P2P network.
//
// Licensed under the AGPL-3.0 license:
// <https://www.gnu.org/licenses/agpl-3.0.html>
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! `<data_dir>/config`: key=value lines (§6). Intentionally not TOML/JSON —
//! the format stays hand-editable and diffs one line per change. Missing
//! file triggers a write of defaults.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub log_level: String,
    pub log_tags: String,
    pub log_file_enabled: bool,
    pub log_max_size_kb: u64,
    pub log_max_files: u32,
    pub bootstrap_nodes: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_tags: String::new(),
            log_file_enabled: true,
            log_max_size_kb: 10_240,
            log_max_files: 5,
            bootstrap_nodes: Vec::new(),
        }
    }
}

impl Config {
    pub fn path(data_dir: &Path) -> PathBuf {
        data_dir.join("config")
    }

    /// Load the config file, writing defaults first if it is absent.
    pub async fn load_or_init(data_dir: &Path) -> Result<Self> {
        let path = Self::path(data_dir);
        if !path.exists() {
            tokio::fs::create_dir_all(data_dir)
                .await
                .with_context(|| format!("creating data dir {}", data_dir.display()))?;
            let defaults = Self::default();
            tokio::fs::write(&path, defaults.render())
                .await
                .with_context(|| format!("writing default config {}", path.display()))?;
            return Ok(defaults);
        }
        let text = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading config {}", path.display()))?;
        Ok(Self::parse(&text))
    }

    fn parse(text: &str) -> Self {
        let mut cfg = Self::default();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let (key, value) = (key.trim(), value.trim());
            match key {
                "log_level" => cfg.log_level = value.to_string(),
                "log_tags" => cfg.log_tags = value.to_string(),
                "log_file_enabled" => cfg.log_file_enabled = value == "true",
                "log_max_size_kb" => {
                    if let Ok(v) = value.parse() {
                        cfg.log_max_size_kb = v;
                    }
                }
                "log_max_files" => {
                    if let Ok(v) = value.parse() {
                        cfg.log_max_files = v;
                    }
                }
                "bootstrap_nodes" => {
                    cfg.bootstrap_nodes = value
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect();
                }
                _ => {}
            }
        }
        cfg
    }

    fn render(&self) -> String {
        format!(
            "log_level={}\nlog_tags={}\nlog_file_enabled={}\nlog_max_size_kb={}\nlog_max_files={}\nbootstrap_nodes={}\n",
            self.log_level,
            self.log_tags,
            self.log_file_enabled,
            self.log_max_size_kb,
            self.log_max_files,
            self.bootstrap_nodes.join(","),
        )
    }
}
