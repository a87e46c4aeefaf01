use std::io::{self, BufRead, Write};

use crate::utils::config::Config;
use log::{debug, error, warn};
pub use rustyline::error::ReadlineError;
use rustyline::history::FileHistory;
use rustyline::Editor;
use rustyline::{CompletionType, Config as RLConfig};

/// Where the shell gets its input lines from. `Ok(None)` is end of input.
pub trait LineSource {
    fn read_line(&mut self, prompt: &str) -> Result<Option<String>, ReadlineError>;

    fn remember(&mut self, _entry: &str) {}

    fn forget_history(&mut self) {}
}

pub struct ReadlineManager<'a> {
    config: &'a Config,
    editor: Editor<(), FileHistory>,
}

impl<'a> ReadlineManager<'a> {
    pub fn new(config: &'a Config) -> Result<Self, ReadlineError> {
        let rl_config = RLConfig::builder()
            .history_ignore_space(true)
            .completion_type(CompletionType::List)
            .edit_mode(config.get_edit_mode())
            .build();

        let editor = Editor::with_config(rl_config).inspect_err(|err| {
            error!("无法初始化 readline: {}", err);
        })?;
        Ok(Self { config, editor })
    }

    pub fn load_history(&mut self) {
        if let Err(err) = self.editor.load_history(&self.config.history_file) {
            warn!(
                "无法加载历史记录: {} {}",
                self.config.history_file.display(),
                err
            );
        } else {
            debug!("历史记录加载成功");
        }
    }

    pub fn entries(&self) -> Vec<String> {
        self.editor.history().iter().cloned().collect()
    }

    pub fn save_history(&mut self) {
        if let Err(err) = self.editor.save_history(&self.config.history_file) {
            error!("保存历史记录失败: {}", err);
        } else {
            debug!("历史记录保存成功");
        }
    }
}

impl LineSource for ReadlineManager<'_> {
    fn read_line(&mut self, prompt: &str) -> Result<Option<String>, ReadlineError> {
        match self.editor.readline(prompt) {
            Ok(line) => Ok(Some(line)),
            Err(ReadlineError::Eof) => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn remember(&mut self, entry: &str) {
        if let Err(err) = self.editor.add_history_entry(entry) {
            warn!("无法添加历史记录: {}", err);
        }
    }

    fn forget_history(&mut self) {
        if let Err(err) = self.editor.clear_history() {
            warn!("无法清除历史记录: {}", err);
        }
    }
}

/// Plain line reader for scripts and non-terminal stdin. Prompts are only
/// shown when `echo_prompt` is set.
pub struct BufLines<R> {
    reader: R,
    echo_prompt: bool,
}

impl<R: BufRead> BufLines<R> {
    pub fn new(reader: R, echo_prompt: bool) -> Self {
        Self {
            reader,
            echo_prompt,
        }
    }
}

impl<R: BufRead> LineSource for BufLines<R> {
    fn read_line(&mut self, prompt: &str) -> Result<Option<String>, ReadlineError> {
        if self.echo_prompt {
            let mut err = io::stderr().lock();
            let _ = write!(err, "{}", prompt);
            let _ = err.flush();
        }
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        if line.ends_with('\n') {
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
        }
        Ok(Some(line))
    }
}
