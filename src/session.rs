use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Context;

use crate::device::UvcDevice;
use crate::error::UvcError;
use crate::negotiation::{NegotiationOutcome, Negotiator};
use crate::pattern::{Checkerboard, FrameProducer};
use crate::pool::FramePool;
use crate::uvc_proto::{Event, EventKind};
use crate::StreamConfig;

const EVENT_POLL: Duration = Duration::from_secs(1);
const PUMP_POLL: Duration = Duration::from_millis(10);

/// Poll cycles without a reclaimable buffer before we log it. 100
/// cycles of 10ms is a full second of host-side stall.
const BACKPRESSURE_REPORT_CYCLES: u32 = 100;

/// What the frame pump pumps into. Split out from the pool and device
/// so the pump loop is testable without hardware.
pub trait FrameSink: Send {
    /// Waits until a transmitted buffer may be ready to reclaim.
    /// `Ok(false)` on timeout.
    fn wait_ready(&self, timeout: Duration) -> crate::error::Result<bool>;

    /// Takes back one transmitted buffer, `None` if nothing is ready.
    fn reclaim(&self) -> crate::error::Result<Option<usize>>;

    /// Fills the slot with frame `frame_index` and hands it to the
    /// kernel. Returns the submitted byte count.
    fn fill_and_submit(&self, slot: usize, frame_index: u64) -> crate::error::Result<u32>;
}

struct PoolSink {
    device: Arc<UvcDevice>,
    pool: Arc<FramePool>,
    producer: Arc<dyn FrameProducer>,
    config: StreamConfig,
}

impl FrameSink for PoolSink {
    fn wait_ready(&self, timeout: Duration) -> crate::error::Result<bool> {
        self.device.wait_writable(timeout)
    }

    fn reclaim(&self) -> crate::error::Result<Option<usize>> {
        self.pool.reclaim_frame(&self.device)
    }

    fn fill_and_submit(&self, slot: usize, frame_index: u64) -> crate::error::Result<u32> {
        let bytes = self.config.frame_size() as u32;
        let (width, height) = (self.config.width, self.config.height);
        let producer = &self.producer;
        self.pool.fill(slot, |buf| {
            producer.fill(width, height, frame_index, &mut buf[..bytes as usize])
        })?;
        self.pool.submit_frame(&self.device, slot, bytes)?;
        Ok(bytes)
    }
}

/// Background thread feeding frames to the kernel while streaming.
///
/// Owns a cancellation token checked every cycle; `stop` sets it and
/// joins, so no submit can happen after `stop` returns.
pub struct FramePump {
    cancel: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl FramePump {
    pub fn spawn(sink: impl FrameSink + 'static, start_frame: u64) -> std::io::Result<FramePump> {
        let cancel = Arc::new(AtomicBool::new(false));
        let token = cancel.clone();
        let handle = thread::Builder::new()
            .name("frame-pump".to_string())
            .spawn(move || pump_loop(sink, &token, start_frame))?;
        Ok(FramePump { cancel, handle })
    }

    pub fn stop(self) {
        self.cancel.store(true, Ordering::Relaxed);
        if self.handle.join().is_err() {
            error!("frame pump thread panicked");
        }
    }
}

fn pump_loop(sink: impl FrameSink, cancel: &AtomicBool, start_frame: u64) {
    let mut frame_index = start_frame;
    let mut idle_cycles: u32 = 0;
    while !cancel.load(Ordering::Relaxed) {
        match sink.wait_ready(PUMP_POLL) {
            Ok(true) => {}
            Ok(false) => {
                idle_cycles += 1;
                if idle_cycles == BACKPRESSURE_REPORT_CYCLES {
                    warn!("{}", UvcError::BackpressureTimeout(idle_cycles));
                    idle_cycles = 0;
                }
                continue;
            }
            Err(e) => {
                warn!("pump wait failed: {}", e);
                thread::sleep(PUMP_POLL);
                continue;
            }
        }
        if cancel.load(Ordering::Relaxed) {
            break;
        }
        match sink.reclaim() {
            Ok(Some(slot)) => {
                idle_cycles = 0;
                match sink.fill_and_submit(slot, frame_index) {
                    Ok(_) => frame_index += 1,
                    Err(e) => warn!("submit of buffer {} failed: {}", slot, e),
                }
            }
            Ok(None) => idle_cycles += 1,
            Err(e) => warn!("reclaim failed: {}", e),
        }
    }
    debug!("frame pump exiting after {} frames", frame_index - start_frame);
}

/// One device session: subscribes to gadget events and runs the
/// dispatch loop until shutdown.
///
/// All session state (negotiation blocks, pool, pump handle) is owned
/// here and mutated only from the loop thread; the pump only touches
/// the pool and device through its sink.
pub struct Session {
    device: Arc<UvcDevice>,
    config: StreamConfig,
    negotiator: Negotiator,
    producer: Arc<dyn FrameProducer>,
    pool: Option<Arc<FramePool>>,
    pump: Option<FramePump>,
    connected: bool,
    streaming: bool,
    next_frame: u64,
}

impl Session {
    pub fn new(device: UvcDevice, config: StreamConfig) -> Session {
        Session::with_producer(device, config, Arc::new(Checkerboard))
    }

    pub fn with_producer(
        device: UvcDevice,
        config: StreamConfig,
        producer: Arc<dyn FrameProducer>,
    ) -> Session {
        Session {
            device: Arc::new(device),
            negotiator: Negotiator::new(&config),
            config,
            producer,
            pool: None,
            pump: None,
            connected: false,
            streaming: false,
            next_frame: 0,
        }
    }

    /// Runs the event loop until `shutdown` is set. Subscription and
    /// poll failures are fatal; everything tied to a single event is
    /// logged and survived.
    pub fn run(&mut self, shutdown: &AtomicBool) -> anyhow::Result<()> {
        self.device.subscribe_all().context("subscribing to gadget events")?;
        info!("session up, waiting for host");

        while !shutdown.load(Ordering::Relaxed) {
            match self.device.wait_event(EVENT_POLL) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => return Err(e).context("polling for events"),
            }
            let event = match self.device.dequeue_event() {
                Ok(event) => event,
                Err(e) => {
                    warn!("dropping undecodable event: {}", e);
                    continue;
                }
            };
            if let Err(e) = self.dispatch(&event) {
                warn!("handling {:?} (seq {}) failed: {}", event.kind.event_type(), event.sequence, e);
            }
        }

        info!("shutdown requested");
        self.teardown();
        Ok(())
    }

    fn dispatch(&mut self, event: &Event) -> crate::error::Result<()> {
        match &event.kind {
            EventKind::Connect => {
                info!("host connected");
                self.connected = true;
                self.negotiator.reset();
                Ok(())
            }
            EventKind::Disconnect => {
                info!("host disconnected");
                self.connected = false;
                let result = if self.streaming { self.stop_streaming() } else { Ok(()) };
                self.negotiator.reset();
                result
            }
            EventKind::Setup(pkt) => {
                // the kernel will not complete the control transfer
                // until it has our response
                let response = self.negotiator.handle_setup(pkt);
                self.device.send_response(&response)
            }
            EventKind::Data(payload) => {
                if self.negotiator.handle_data(payload) == NegotiationOutcome::Committed {
                    self.device.set_format(&self.config)?;
                }
                Ok(())
            }
            EventKind::StreamOn => self.start_streaming(),
            EventKind::StreamOff => {
                if self.streaming {
                    self.stop_streaming()
                } else {
                    debug!("STREAMOFF while not streaming, ignoring");
                    Ok(())
                }
            }
        }
    }

    fn start_streaming(&mut self) -> crate::error::Result<()> {
        if self.streaming {
            debug!("STREAMON while streaming, ignoring");
            return Ok(());
        }
        if !self.connected {
            debug!("STREAMON without a CONNECT event");
        }
        // STREAMON with no COMMIT is legal; the defaults apply
        self.device.set_format(&self.config)?;
        let pool = match self.pool.clone() {
            Some(pool) => pool,
            None => {
                let pool = Arc::new(FramePool::create(&self.device, self.config.buffer_count)?);
                self.pool = Some(pool.clone());
                pool
            }
        };

        let bytes = self.config.frame_size() as u32;
        for slot in 0..pool.len() {
            let (width, height, frame_index) = (self.config.width, self.config.height, self.next_frame);
            let producer = self.producer.clone();
            pool.fill(slot, |buf| {
                producer.fill(width, height, frame_index, &mut buf[..bytes as usize])
            })?;
            pool.submit_frame(&self.device, slot, bytes)?;
            self.next_frame += 1;
        }

        self.device.stream_on()?;
        let sink = PoolSink {
            device: self.device.clone(),
            pool,
            producer: self.producer.clone(),
            config: self.config,
        };
        self.pump = Some(
            FramePump::spawn(sink, self.next_frame).map_err(|e| UvcError::io("spawn frame pump", e))?,
        );
        self.streaming = true;
        info!(
            "streaming {}x{} at {} ({} fps negotiated)",
            self.config.width, self.config.height,
            self.negotiator.committed().dw_frame_interval,
            self.negotiator.committed().fps()
        );
        Ok(())
    }

    fn stop_streaming(&mut self) -> crate::error::Result<()> {
        // pump first, so nothing races the STREAMOFF ioctl
        if let Some(pump) = self.pump.take() {
            pump.stop();
        }
        self.streaming = false;
        let result = self.device.stream_off();
        // the stream is down whether or not the ioctl reached the
        // driver (unplug mid-stream); every slot comes home either way
        if let Some(pool) = &self.pool {
            pool.release_all();
        }
        result?;
        info!("streaming stopped");
        Ok(())
    }

    fn teardown(&mut self) {
        if self.streaming {
            if let Err(e) = self.stop_streaming() {
                warn!("teardown: {}", e);
            }
        }
    }
}
