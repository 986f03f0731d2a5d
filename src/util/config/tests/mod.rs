//! Config 单元测试

use super::*;

#[cfg(test)]
mod config_tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = RuntimeConfig::from_ron_str("()").unwrap();
        assert_eq!(config, RuntimeConfig::default());
        assert_eq!(config.allocator.slab_size, DEFAULT_SLAB_SIZE);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_partial_config() {
        let config =
            RuntimeConfig::from_ron_str("(scheduler: (workers: 3, idle_timeout_ms: 5))").unwrap();
        assert_eq!(config.scheduler.workers, 3);
        assert_eq!(config.scheduler.idle_timeout(), Duration::from_millis(5));
        assert_eq!(config.scheduler.steal_batch, 4);
        assert!(config.scheduler.use_work_stealing);
    }

    #[test]
    fn test_parse_error() {
        let err = RuntimeConfig::from_ron_str("(scheduler: (workers: \"many\"))").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        assert!(err.to_string().starts_with("Config parse error"));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("taskcore.ron");

        let mut config = RuntimeConfig::default();
        config.scheduler.workers = 7;
        config.allocator.slab_size = 4096;
        config.log.level = "debug".to_string();

        save_config(&path, &config).unwrap();
        let loaded = load_config(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(&dir.path().join("absent.ron")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
