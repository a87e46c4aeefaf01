use clap::Parser;
use log::debug;

use crate::args::Args;
use crate::shell::Shell;
use crate::utils::config::Config;
use crate::utils::log::init_logger;

mod args;
mod shell;
mod utils;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = Config::new()?;
    if let Err(err) = init_logger(&config) {
        eprintln!("jobsh: 日志初始化失败: {}", err);
    }
    debug!("配置加载成功 {}", config.config_dir.display());

    let mut shell = Shell::new(&config);
    let status = match (args.command, args.script) {
        (Some(command), script) => {
            let mut positional: Vec<String> = script
                .map(|name| name.display().to_string())
                .into_iter()
                .collect();
            positional.extend(args.args);
            shell.install_reaper();
            shell.run_command(&command, positional)
        }
        (None, Some(script)) => {
            shell.install_reaper();
            shell.run_script(&script, args.args)
        }
        (None, None) => shell.run()?,
    };
    debug!("退出状态 {}", status);
    std::process::exit(status & 0xff)
}
