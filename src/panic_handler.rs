use log::error;
use std::panic;

/// Installs readable backtraces and routes every panic into the log before
/// the default report runs. Worker panics are caught by the scheduler, so
/// this hook sees them too without the process going down.
pub fn initialize_panic_handler() {
    better_panic::install();

    let default_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let thread = std::thread::current();
        let name = thread.name().unwrap_or("<unnamed>");
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_default();
        error!("thread '{name}' panicked at {location}: {}", payload(panic_info));

        default_hook(panic_info);
    }));
}

fn payload<'a>(info: &'a panic::PanicHookInfo<'a>) -> &'a str {
    if let Some(s) = info.payload().downcast_ref::<&str>() {
        s
    } else if let Some(s) = info.payload().downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string payload>"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[test]
    fn payload_reads_str_and_string_messages() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let previous = panic::take_hook();
        {
            let seen = Arc::clone(&seen);
            panic::set_hook(Box::new(move |info| {
                if let Ok(mut seen) = seen.lock() {
                    seen.push(payload(info).to_string());
                }
            }));
        }
        let code = 7;
        let _ = panic::catch_unwind(|| panic!("static message"));
        let _ = panic::catch_unwind(|| panic!("formatted {code}"));
        let _ = panic::catch_unwind(|| panic::panic_any(42_u8));
        panic::set_hook(previous);

        let seen = seen.lock().unwrap();
        assert!(seen.iter().any(|s| s == "static message"));
        assert!(seen.iter().any(|s| s == "formatted 7"));
        assert!(seen.iter().any(|s| s == "<non-string payload>"));
    }
}
