use crossbeam_channel::{Receiver, Sender};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use std::thread::{self, JoinHandle};

/// Name of the thread that feeds observers.
pub const DISPATCHER_THREAD_NAME: &str = "cellsim-progress";

/// Quantity a progress event reports on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metric {
    /// Overall completion, integer percent in `0..=100`.
    Progress,
    /// Last completed cycle.
    Cycle,
    /// Total population after the last completed cycle.
    CellCount,
    /// Terminal event; `new` is the last completed cycle, `old` is always `-1`.
    Finished,
}

impl Metric {
    fn index(self) -> usize {
        match self {
            Metric::Progress => 0,
            Metric::Cycle => 1,
            Metric::CellCount => 2,
            Metric::Finished => 3,
        }
    }
}

/// Property-change style notification: `metric` went from `old` to `new`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressEvent {
    pub metric: Metric,
    pub old: i64,
    pub new: i64,
}

/// Receives progress events on the dispatcher thread, never on a worker.
pub trait ProgressObserver: Send {
    fn on_event(&mut self, event: &ProgressEvent);

    /// Called once after the last event, when the run drops its sink.
    fn on_close(&mut self) {}
}

/// Publishing side of the progress channel. Owned by the barrier action.
///
/// `publish` only enqueues, so a slow observer never holds up a rendezvous.
pub struct ProgressSink {
    sender: Option<Sender<ProgressEvent>>,
    last: [i64; 4],
}

impl ProgressSink {
    /// A sink plus the receiving end, for callers that drive their own dispatch loop.
    pub fn channel() -> (Self, Receiver<ProgressEvent>) {
        let (sender, receiver) = crossbeam_channel::unbounded();
        (Self { sender: Some(sender), last: [0; 4] }, receiver)
    }

    /// A sink that drops every event.
    pub fn disabled() -> Self {
        Self { sender: None, last: [0; 4] }
    }

    pub fn is_open(&self) -> bool {
        self.sender.is_some()
    }

    /// Sends `old -> new` unless nothing changed.
    pub fn publish(&mut self, metric: Metric, old: i64, new: i64) {
        self.last[metric.index()] = new;
        if old == new {
            return;
        }
        if let Some(sender) = &self.sender {
            if sender.send(ProgressEvent { metric, old, new }).is_err() {
                debug!("Progress dispatcher is gone; dropping further events.");
                self.sender = None;
            }
        }
    }

    /// Publishes `new` against the last value sent for this metric.
    pub fn update(&mut self, metric: Metric, new: i64) {
        let old = self.last[metric.index()];
        self.publish(metric, old, new);
    }

    /// Discretizes `fraction` to a whole percent and publishes only when the percent moves.
    /// Never moves backwards, even when the population shrinks away from its limit.
    pub fn update_progress(&mut self, fraction: f64) {
        let percent = if fraction.is_finite() { (fraction.clamp(0.0, 1.0) * 100.0).floor() as i64 } else { 0 };
        let previous = self.last[Metric::Progress.index()];
        self.update(Metric::Progress, percent.max(previous));
    }

    /// Publishes the terminal `Finished` event and closes the sink.
    pub fn finish(&mut self, last_cycle: i64) {
        self.publish(Metric::Finished, -1, last_cycle);
        self.close();
    }

    /// Drops the sender; the dispatcher drains what is queued and exits.
    pub fn close(&mut self) {
        self.sender = None;
    }
}

/// Starts the dispatcher thread and returns the sink that feeds it.
pub fn spawn_dispatcher(
    observers: Vec<Box<dyn ProgressObserver>>,
) -> std::io::Result<(ProgressSink, JoinHandle<()>)> {
    let (sink, events) = ProgressSink::channel();
    let handle = thread::Builder::new()
        .name(DISPATCHER_THREAD_NAME.to_string())
        .spawn(move || dispatch(events, observers))?;
    Ok((sink, handle))
}

/// Feeds every event to every observer until all senders are dropped.
pub fn dispatch(events: Receiver<ProgressEvent>, mut observers: Vec<Box<dyn ProgressObserver>>) {
    for event in events.iter() {
        for observer in observers.iter_mut() {
            observer.on_event(&event);
        }
    }
    for observer in observers.iter_mut() {
        observer.on_close();
    }
}

/// Writes progress to the log.
#[derive(Debug, Default)]
pub struct LogObserver {
    cells: i64,
}

impl LogObserver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressObserver for LogObserver {
    fn on_event(&mut self, event: &ProgressEvent) {
        match event.metric {
            Metric::CellCount => self.cells = event.new,
            Metric::Progress if event.new % 10 == 0 => {
                info!("Progress: {:3}% | Cells: {}", event.new, self.cells);
            }
            Metric::Progress => debug!("Progress: {}%", event.new),
            Metric::Cycle => debug!("Cycle {} complete.", event.new),
            Metric::Finished => info!("Run finished after cycle {} with {} cells.", event.new, self.cells),
        }
    }
}

/// Console progress bar over 0..=100 percent.
pub struct ProgressBarObserver {
    bar: ProgressBar,
    cycle: i64,
    cells: i64,
}

impl ProgressBarObserver {
    pub fn new() -> Self {
        let bar = ProgressBar::new(100);
        match ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos:>3}% {msg}")
        {
            Ok(style) => bar.set_style(style.progress_chars("#>-")),
            Err(e) => warn!("Invalid progress bar template, using default style: {}", e),
        }
        Self { bar, cycle: 0, cells: 0 }
    }

    fn refresh_message(&self) {
        self.bar.set_message(format!("cycle {} | {} cells", self.cycle, self.cells));
    }
}

impl Default for ProgressBarObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressObserver for ProgressBarObserver {
    fn on_event(&mut self, event: &ProgressEvent) {
        match event.metric {
            Metric::Progress => self.bar.set_position(event.new.clamp(0, 100) as u64),
            Metric::Cycle => {
                self.cycle = event.new;
                self.refresh_message();
            }
            Metric::CellCount => {
                self.cells = event.new;
                self.refresh_message();
            }
            Metric::Finished => self
                .bar
                .finish_with_message(format!("done at cycle {} | {} cells", event.new, self.cells)),
        }
    }

    fn on_close(&mut self) {
        // Aborted runs never see `Finished`.
        if !self.bar.is_finished() {
            self.bar.abandon();
        }
    }
}

/// Forwards every event to a channel.
pub struct ChannelObserver {
    sender: Sender<ProgressEvent>,
}

impl ChannelObserver {
    pub fn new(sender: Sender<ProgressEvent>) -> Self {
        Self { sender }
    }
}

impl ProgressObserver for ChannelObserver {
    fn on_event(&mut self, event: &ProgressEvent) {
        // Receiver gone just means nobody is listening any more.
        let _ = self.sender.send(*event);
    }
}
