use anyhow::Result;
use bosun_server::Config;
use bosun_util::log::run_with_logger;

fn main() -> Result<()> {
    let config = Config::new()?;
    run_with_logger(config.log_level, |log| bosun_server::main(config, log))
}
