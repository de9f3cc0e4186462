//! Terminal side of the event channel and the confirmation prompt.

use std::io::{self, BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use flashkit_core::{Confirm, FlashEvent, LogLevel};

const PUMP_TICK: Duration = Duration::from_millis(100);

/// Print one event for a human reader.
pub fn print_event(event: &FlashEvent) {
    match event {
        FlashEvent::Log { level, message } => match level {
            LogLevel::Trace | LogLevel::Debug => {}
            LogLevel::Info => println!("{}", message),
            LogLevel::Warn => eprintln!("warning: {}", message),
            LogLevel::Error => eprintln!("error: {}", message),
        },
        FlashEvent::Progress { operation, percent } => {
            print!("\r{}: {:>3}%", operation, percent);
            if *percent >= 100 {
                println!();
            }
            let _ = io::stdout().flush();
        }
        FlashEvent::Transition { from, to } => {
            println!("device: {} -> {}", from, to);
        }
        FlashEvent::DeviceProperties { id, properties } => {
            println!("{}:", id);
            for (key, value) in properties {
                println!("  {:<34} {}", key, value);
            }
        }
        FlashEvent::JobComplete { summary, .. } => println!("{}", summary),
    }
}

/// Print everything already queued.
pub fn drain(rx: &Receiver<FlashEvent>) {
    while let Ok(event) = rx.try_recv() {
        print_event(&event);
    }
}

/// Print events while `worker` runs, then whatever it left queued.
pub fn pump_until_finished<T>(rx: &Receiver<FlashEvent>, worker: &JoinHandle<T>) {
    while !worker.is_finished() {
        match rx.recv_timeout(PUMP_TICK) {
            Ok(event) => print_event(&event),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
    drain(rx);
}

/// Print events until `deadline` passes or `interrupted` is raised.
pub fn pump_until(rx: &Receiver<FlashEvent>, deadline: Option<Instant>, interrupted: &AtomicBool) {
    while !interrupted.load(Ordering::SeqCst) {
        let wait = match deadline {
            Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
                Some(left) => left.min(PUMP_TICK),
                None => return,
            },
            None => PUMP_TICK,
        };
        match rx.recv_timeout(wait) {
            Ok(event) => print_event(&event),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

/// Asks on stderr and reads the answer from stdin.
pub struct StdinConfirm {
    pub assume_yes: bool,
}

impl Confirm for StdinConfirm {
    fn confirm(&self, prompt: &str) -> bool {
        if self.assume_yes {
            eprintln!("{} [y/N] y (--yes)", prompt);
            return true;
        }
        eprint!("{} [y/N] ", prompt);
        let _ = io::stderr().flush();

        let mut answer = String::new();
        if io::stdin().lock().read_line(&mut answer).is_err() {
            return false;
        }
        matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
    }
}
