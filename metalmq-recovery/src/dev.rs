use env_logger::Builder;
use std::io::Write;

/// Set up a colored logger. The log level comes from `RUST_LOG`.
///
/// With `is_test` the output goes through the test harness, so it is captured for passing tests.
pub fn setup_logger(is_test: bool) {
    let mut builder = Builder::from_default_env();

    builder
        .format_timestamp_millis()
        .format(|buf, record| {
            let lvl = buf.default_level_style(record.level()).bold();

            writeln!(
                buf,
                "{} - [{lvl}{:5}{lvl:#}] {}:{} - {}",
                buf.timestamp_millis(),
                record.level(),
                record.file().unwrap_or_default(),
                record.line().unwrap_or_default(),
                record.args()
            )
        })
        .is_test(is_test);

    // other tests may have set it up already
    let _ = builder.try_init();
}
