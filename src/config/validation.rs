use crate::config::types::{Config, PipelineConfig, SinkConfig, SourceConfig, StoreConfig, TimingConfig};
use crate::ConfigError;
use std::collections::HashSet;

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_pipeline_config(&config.pipeline)?;
    validate_timing_config(&config.timing)?;
    validate_store_config(&config.store)?;
    validate_sink_config(&config.sink)?;
    validate_source_config(&config.source)?;
    Ok(())
}

/// Validates pipeline sizing
fn validate_pipeline_config(config: &PipelineConfig) -> Result<(), ConfigError> {
    if config.workers < 1 || config.workers > 256 {
        return Err(ConfigError::Validation(format!(
            "workers must be between 1 and 256, got {}",
            config.workers
        )));
    }

    if config.schedulers < 1 {
        return Err(ConfigError::Validation(format!(
            "schedulers must be >= 1, got {}",
            config.schedulers
        )));
    }

    if config.max_retries < 1 {
        return Err(ConfigError::Validation(format!(
            "max_retries must be >= 1, got {}",
            config.max_retries
        )));
    }

    if config.queue_length_threshold < 1 {
        return Err(ConfigError::Validation(format!(
            "queue_length_threshold must be >= 1, got {}",
            config.queue_length_threshold
        )));
    }

    if config.sink_batch_length < 1 {
        return Err(ConfigError::Validation(format!(
            "sink_batch_length must be >= 1, got {}",
            config.sink_batch_length
        )));
    }

    Ok(())
}

/// Validates poll intervals
fn validate_timing_config(config: &TimingConfig) -> Result<(), ConfigError> {
    // A zero poll interval turns every idle loop into a spin
    let intervals = [
        ("poll_wait", config.poll_wait_ms),
        ("poll_block", config.poll_block_ms),
        ("seed_backoff", config.seed_backoff_ms),
        ("sink_backoff", config.sink_backoff_ms),
        ("monitor_interval", config.monitor_interval_ms),
        ("idle_wait", config.idle_wait_ms),
        ("heartbeat_interval", config.heartbeat_interval_ms),
    ];

    for (name, value) in intervals {
        if value == 0 {
            return Err(ConfigError::Validation(format!(
                "{} must be > 0ms",
                name
            )));
        }
    }

    if config.poll_block_ms < config.poll_wait_ms {
        return Err(ConfigError::Validation(format!(
            "poll_block ({}ms) must not be shorter than poll_wait ({}ms)",
            config.poll_block_ms, config.poll_wait_ms
        )));
    }

    Ok(())
}

/// Validates durable store configuration
fn validate_store_config(config: &StoreConfig) -> Result<(), ConfigError> {
    if config.database_path.is_empty() {
        return Err(ConfigError::Validation(
            "store database_path cannot be empty".to_string(),
        ));
    }

    if config.lock_ttl_ms == 0 {
        return Err(ConfigError::Validation(
            "lock_ttl must be > 0ms".to_string(),
        ));
    }

    Ok(())
}

/// Validates sink configuration
fn validate_sink_config(config: &SinkConfig) -> Result<(), ConfigError> {
    if config.database_path.is_empty() {
        return Err(ConfigError::Validation(
            "sink database_path cannot be empty".to_string(),
        ));
    }

    if matches!(config.jsonl_path.as_deref(), Some("")) {
        return Err(ConfigError::Validation(
            "sink jsonl_path cannot be empty when set".to_string(),
        ));
    }

    if config.destinations.is_empty() {
        return Err(ConfigError::Validation(
            "at least one sink destination is required".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    for destination in &config.destinations {
        validate_destination_name(destination)?;
        if !seen.insert(destination.as_str()) {
            return Err(ConfigError::Validation(format!(
                "destination '{}' is listed twice",
                destination
            )));
        }
    }

    Ok(())
}

/// Validates a destination name: non-empty, alphanumeric, '_' or '-'
fn validate_destination_name(name: &str) -> Result<(), ConfigError> {
    if name.is_empty() {
        return Err(ConfigError::Validation(
            "destination name cannot be empty".to_string(),
        ));
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(ConfigError::Validation(format!(
            "destination '{}' must contain only alphanumeric characters, '_' or '-'",
            name
        )));
    }

    Ok(())
}

/// Validates the seed source
fn validate_source_config(config: &SourceConfig) -> Result<(), ConfigError> {
    if config.replenish_batch < 1 {
        return Err(ConfigError::Validation(format!(
            "replenish_batch must be >= 1, got {}",
            config.replenish_batch
        )));
    }

    if config.seeds.iter().any(|seed| seed.trim().is_empty()) {
        return Err(ConfigError::Validation(
            "seed payloads cannot be blank".to_string(),
        ));
    }

    Ok(())
}
