pub mod logging;

fn env_truthy(var: &str) -> Option<bool> {
    std::env::var(var)
        .map(|v| v != "0" && !v.is_empty())
        .ok()
}
