#[macro_use]
extern crate log;

use std::env;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;

use uvc_func::{Session, StreamConfig, UvcDevice};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_signum: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

fn main() -> anyhow::Result<()> {
    pretty_env_logger::init_timed();

    let path = env::args().nth(1).unwrap_or_else(|| "/dev/video0".to_string());
    let config = StreamConfig::default();

    let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
    unsafe {
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
    }

    let device = UvcDevice::open(&path).with_context(|| format!("opening {}", path))?;
    device.set_format(&config).context("setting initial format")?;

    info!(
        "uvc function on {} ({}x{} YUYV @ {} fps)",
        path, config.width, config.height, config.fps
    );

    let mut session = Session::new(device, config);
    session.run(&SHUTDOWN)
}
