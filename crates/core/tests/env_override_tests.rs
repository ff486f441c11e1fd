use scheduler_core::config::AppConfig;
use std::env;
use std::io::Write;

#[test]
fn test_environment_overrides_file() {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .unwrap();
    file.write_all(b"[scheduler]\nthreads = 4\n").unwrap();
    file.flush().unwrap();

    env::set_var("SCHEDULER_SCHEDULER__THREADS", "7");
    env::set_var("SCHEDULER_SCHEDULER__TABLE_NAME", "jobs");
    let config = AppConfig::load(Some(file.path().to_str().unwrap()));
    env::remove_var("SCHEDULER_SCHEDULER__THREADS");
    env::remove_var("SCHEDULER_SCHEDULER__TABLE_NAME");

    let config = config.unwrap();
    assert_eq!(config.scheduler.threads, 7);
    assert_eq!(config.scheduler.table_name, "jobs");
}
