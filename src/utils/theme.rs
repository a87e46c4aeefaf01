use colored::Colorize;

pub struct Theme {
    pub prompt: String,
    pub continuation_prompt: String,
    pub error_style: Box<dyn Fn(String) -> String>,
    pub success_style: Box<dyn Fn(String) -> String>,
}

impl Default for Theme {
    fn default() -> Self {
        Theme {
            prompt: "$ ".to_string(),
            continuation_prompt: "> ".to_string(),
            error_style: Box::new(|s| s.red().to_string()),
            success_style: Box::new(|s| s.green().to_string()),
        }
    }
}

impl Theme {
    /// Prompt coloured by the previous command's status.
    pub fn prompt_for(&self, last_status: i32) -> String {
        if last_status == 0 {
            (self.success_style)(self.prompt.clone())
        } else {
            (self.error_style)(format!("[{}]{}", last_status, self.prompt))
        }
    }

    pub fn continuation(&self) -> String {
        self.continuation_prompt.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_shows_failed_status() {
        colored::control::set_override(false);
        let theme = Theme::default();
        assert_eq!(theme.prompt_for(0), "$ ");
        assert_eq!(theme.prompt_for(127), "[127]$ ");
        assert_eq!(theme.continuation(), "> ");
    }
}
