use fairshare_blocks::allocator::Reconciler;
use fairshare_blocks::allocator::reconciler::spawn_stats_reporter;
use fairshare_blocks::config::{AllocatorConfig, PolicyKind};

fn usage(program: &str) -> String {
    format!(
        "Usage: {0} [--config <file.json>] [--policy karma|maxmin] [--tenants <n>] [--blocks <n>] \
         [--public <n>] [--credits <n>] [--interval-ms <ms>] [--stats-ms <ms>] \
         [--log trace|debug|info|warn|error]\n\
         Example: {0} --policy karma --tenants 3 --blocks 33 --public 3",
        program
    )
}

fn parse_args(args: &[String]) -> anyhow::Result<AllocatorConfig> {
    let config_path = args
        .windows(2)
        .find(|pair| pair[0] == "--config")
        .map(|pair| pair[1].clone());
    let mut config = match config_path {
        Some(path) => AllocatorConfig::from_file(path)?,
        None => AllocatorConfig::default(),
    };

    let mut i = 1;
    while i < args.len() {
        let value = args
            .get(i + 1)
            .ok_or_else(|| anyhow::anyhow!("Missing value for {}", args[i]));
        match args[i].as_str() {
            "--config" => {}
            "--policy" => config.policy = value?.parse::<PolicyKind>()?,
            "--tenants" => config.num_tenants = value?.parse()?,
            "--blocks" => config.num_blocks = value?.parse()?,
            "--public" => config.public_blocks = value?.parse()?,
            "--credits" => config.init_credits = value?.parse()?,
            "--interval-ms" => config.reconcile_interval_ms = value?.parse()?,
            "--stats-ms" => config.stats_interval_ms = value?.parse()?,
            "--log" => config.log_level = value?.clone(),
            other => return Err(anyhow::anyhow!("Unknown argument: {}", other)),
        }
        i += 2;
    }

    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();

    let config = match parse_args(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            eprintln!("{}", usage(&args[0]));
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_max_level(config.log_level()?)
        .init();

    tracing::info!("Starting allocator node with {:?}", config);

    // 1. Allocator and its block pool:
    let policy = config.build_policy();
    let blocks: Vec<String> = (0..config.num_blocks)
        .map(|i| format!("block-{}", i))
        .collect();
    policy.add_blocks(&blocks);

    // 2. Background reconciliation:
    let reconciler = Reconciler::new(policy.clone(), config.reconcile_interval());
    let cancel = reconciler.cancellation_token();
    let reconcile_handle = reconciler.clone().start();

    // 3. Stats reporter:
    let stats_handle = spawn_stats_reporter(policy.clone(), config.stats_interval(), cancel.clone());

    tracing::info!("Press Ctrl+C to shutdown");
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down");
    reconciler.stop();
    for handle in [reconcile_handle, stats_handle].into_iter().flatten() {
        if let Err(e) = handle.await {
            tracing::warn!("Background task ended abnormally: {}", e);
        }
    }

    let stats = policy.stats();
    tracing::info!(
        "Final state: {} of {} blocks allocated",
        stats.allocated_blocks,
        stats.total_blocks
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Vec<String> {
        std::iter::once("fairshare-blocks")
            .chain(extra.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_usage_lists_every_accepted_flag() {
        let text = usage("fairshare-blocks");
        for (flag, value) in [
            ("--policy", "maxmin"),
            ("--tenants", "3"),
            ("--blocks", "33"),
            ("--public", "3"),
            ("--credits", "10"),
            ("--interval-ms", "0"),
            ("--stats-ms", "0"),
            ("--log", "debug"),
        ] {
            assert!(parse_args(&args(&[flag, value])).is_ok(), "{} rejected", flag);
            assert!(text.contains(flag), "{} missing from usage", flag);
        }
        assert!(text.contains("--config"));
    }

    #[test]
    fn test_unknown_flag_and_missing_value_are_rejected() {
        assert!(parse_args(&args(&["--verbose", "1"])).is_err());
        assert!(parse_args(&args(&["--tenants"])).is_err());
    }
}
