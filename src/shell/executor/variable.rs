use std::collections::HashMap;
use std::env;
use std::ffi::CString;

#[derive(Debug, Clone)]
struct Var {
    value: String,
    exported: bool,
}

/// Shell variables plus the positional parameters.
#[derive(Debug, Clone, Default)]
pub struct Variables {
    vars: HashMap<String, Var>,
    positional: Vec<String>,
    script_name: String,
}

impl Variables {
    pub fn new() -> Self {
        Self {
            vars: HashMap::new(),
            positional: Vec::new(),
            script_name: env!("CARGO_PKG_NAME").to_string(),
        }
    }

    /// Starts from the process environment, everything exported. Entries
    /// that are not valid UTF-8 are skipped.
    pub fn from_env() -> Self {
        let mut variables = Self::new();
        for (name, value) in env::vars_os() {
            if let (Ok(name), Ok(value)) = (name.into_string(), value.into_string()) {
                variables.export(&name, Some(value));
            }
        }
        variables
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(|var| var.value.as_str())
    }

    /// Sets a value, keeping the exported flag of an existing variable.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.vars.get_mut(name) {
            Some(var) => var.value = value,
            None => {
                self.vars.insert(
                    name.to_string(),
                    Var {
                        value,
                        exported: false,
                    },
                );
            }
        }
    }

    pub fn export(&mut self, name: &str, value: Option<String>) {
        let var = self.vars.entry(name.to_string()).or_insert(Var {
            value: String::new(),
            exported: true,
        });
        var.exported = true;
        if let Some(value) = value {
            var.value = value;
        }
    }

    pub fn unset(&mut self, name: &str) -> bool {
        self.vars.remove(name).is_some()
    }

    pub fn is_exported(&self, name: &str) -> bool {
        self.vars.get(name).is_some_and(|var| var.exported)
    }

    /// Exported variables sorted by name.
    pub fn exported(&self) -> Vec<(&str, &str)> {
        let mut list: Vec<_> = self
            .vars
            .iter()
            .filter(|(_, var)| var.exported)
            .map(|(name, var)| (name.as_str(), var.value.as_str()))
            .collect();
        list.sort();
        list
    }

    /// `NAME=value` strings for execve. Entries with interior NULs are dropped.
    pub fn envp(&self) -> Vec<CString> {
        self.exported()
            .into_iter()
            .filter_map(|(name, value)| CString::new(format!("{}={}", name, value)).ok())
            .collect()
    }

    pub fn positional(&self) -> &[String] {
        &self.positional
    }

    /// Replaces `$1..`, returning the previous list so callers can restore it.
    pub fn set_positional(&mut self, args: Vec<String>) -> Vec<String> {
        std::mem::replace(&mut self.positional, args)
    }

    pub fn script_name(&self) -> &str {
        &self.script_name
    }

    pub fn set_script_name(&mut self, name: impl Into<String>) {
        self.script_name = name.into();
    }
}
