use std::sync::Once;

static INIT: Once = Once::new();

// tests call this from every module, only the first one wins
pub fn setup_logger() {
    INIT.call_once(|| {
        pretty_env_logger::init_timed();
    });
}
