use dotenv::dotenv;
use rustyline::EditMode;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub struct Config {
    /// Log target the level filter applies to.
    pub name: String,
    pub config_dir: PathBuf,
    pub history_file: PathBuf,
    /// Sourced by interactive sessions before the first prompt.
    pub rc_file: PathBuf,
    pub editor_mode: String,
    pub logger_level: String,
    pub logger_dir: PathBuf,
    pub logger_stderr: bool,
}

impl Config {
    fn get_config_dir() -> PathBuf {
        if let Ok(home) = env::var("HOME") {
            PathBuf::from(home).join(".config/jobsh")
        } else {
            env::temp_dir().join("jobsh")
        }
    }

    fn get_rc_file(config_dir: &Path) -> PathBuf {
        match env::var("HOME") {
            Ok(home) => PathBuf::from(home).join(".jobshrc"),
            Err(_) => config_dir.join(".jobshrc"),
        }
    }

    pub(crate) fn default() -> Self {
        let config_dir = Self::get_config_dir();
        Config {
            name: env!("CARGO_PKG_NAME").to_string(),
            history_file: config_dir.join(".jobsh_history"),
            rc_file: Self::get_rc_file(&config_dir),
            logger_dir: config_dir.join("logs"),
            config_dir,
            editor_mode: String::from("emacs"),
            logger_level: String::from("warn"),
            logger_stderr: false,
        }
    }

    pub fn new() -> io::Result<Self> {
        // 优先加载 .env 文件
        if cfg!(debug_assertions) {
            dotenv::from_filename(".env.development").ok();
        } else {
            dotenv().ok();
        }

        let mut config = Config::default();

        // 环境变量覆盖默认配置
        if let Ok(history) = env::var("JOBSH_HISTORY") {
            config.history_file = PathBuf::from(history);
        }

        if let Ok(rc) = env::var("JOBSH_RC") {
            config.rc_file = PathBuf::from(rc);
        }

        if let Ok(editor) = env::var("JOBSH_EDITOR") {
            config.editor_mode = editor;
        }

        if let Ok(level) = env::var("JOBSH_LOG_LEVEL") {
            config.logger_level = level;
        }

        if let Ok(dir) = env::var("JOBSH_LOG_DIR") {
            config.logger_dir = PathBuf::from(dir);
        }

        if let Ok(flag) = env::var("JOBSH_LOG_STDERR") {
            config.logger_stderr = matches!(flag.to_lowercase().as_str(), "1" | "true" | "yes");
        }

        // 确保历史文件目录存在
        if let Some(parent) = config.history_file.parent() {
            fs::create_dir_all(parent)?;
        }

        Ok(config)
    }

    pub fn get_edit_mode(&self) -> EditMode {
        match self.editor_mode.to_lowercase().as_str() {
            "vi" => EditMode::Vi,
            _ => EditMode::Emacs,
        }
    }
}
