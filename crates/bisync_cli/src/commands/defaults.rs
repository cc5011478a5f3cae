//! Defaults command implementation.

use bisync_engine::EngineConfig;

/// Runs the defaults command.
pub fn run(format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let config = EngineConfig::default();

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        _ => print_text_output(&config),
    }

    Ok(())
}

fn print_text_output(config: &EngineConfig) {
    println!("Engine configuration:");
    println!("  debounce:                {:?}", config.timing.debounce);
    println!("  throttle interval:       {:?}", config.timing.throttle_interval);
    println!("  throttle mode:           {:?}", config.timing.throttle_mode);
    println!("  sync timeout:            {:?}", config.sync_timeout);
    println!("  max history:             {}", config.max_history);
    println!("  max event history:       {}", config.max_event_history);
    println!("Retry:");
    println!("  data-error attempts:     {}", config.retry.max_data_attempts);
    println!(
        "  transient system retries: {}",
        config.retry.max_transient_system_retries
    );
    println!("  base interval:           {:?}", config.retry.base_interval);
    println!(
        "  jitter:                  {:.0}%",
        config.retry.jitter_fraction * 100.0
    );
    println!("  max delay:               {:?}", config.retry.max_delay);
}
