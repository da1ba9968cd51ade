//! Simulate command implementation.
//!
//! Emits synthetic pipeline status lines on stdout so the server can be
//! exercised without a camera, e.g. with
//! `pipeline.command: "varroa-monitor simulate --frames 3000"`.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::io::{self, Write};
use std::thread;
use std::time::Duration;

/// Frames between two unique-count reports.
const UNIQUE_REPORT_EVERY: u64 = 5;

/// Rolling state of the fake hive.
struct Hive {
    rng: StdRng,
    unique_bees: u64,
    unique_varroa: u64,
    /// Chance that a newly seen bee carries a mite
    mite_rate: f64,
}

impl Hive {
    fn new(seed: Option<u64>) -> Self {
        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mite_rate = rng.gen_range(0.01..0.2);
        Self {
            rng,
            unique_bees: 0,
            unique_varroa: 0,
            mite_rate,
        }
    }

    /// Lines for one frame.
    fn frame(&mut self, frame: u64) -> Vec<String> {
        let current_bees: u64 = self.rng.gen_range(0..12);
        let current_varroa = (0..current_bees)
            .filter(|_| self.rng.gen_bool(self.mite_rate))
            .count() as u64;

        if self.rng.gen_bool(0.3) {
            let new_bees = self.rng.gen_range(1..4);
            self.unique_bees += new_bees;
            self.unique_varroa += (0..new_bees)
                .filter(|_| self.rng.gen_bool(self.mite_rate))
                .count() as u64;
        }

        let mut lines = vec![
            format!("Frame count: {frame}"),
            format!("Current frame bees: {current_bees}"),
            format!("Current frame varroa: {current_varroa}"),
        ];
        if frame % UNIQUE_REPORT_EVERY == 0 {
            lines.push(format!("Unique bees: {}", self.unique_bees));
            lines.push(format!("Unique varroa: {}", self.unique_varroa));
        }
        lines
    }
}

/// Writes `frames` frames of protocol output, one frame every `interval_ms`.
pub fn command_simulate(frames: u64, interval_ms: u64, seed: Option<u64>) -> anyhow::Result<()> {
    let mut hive = Hive::new(seed);
    let stdout = io::stdout();
    let interval = Duration::from_millis(interval_ms);

    for frame in 1..=frames {
        let mut out = stdout.lock();
        for line in hive.frame(frame) {
            if let Err(e) = writeln!(out, "{line}") {
                // Reader went away
                if e.kind() == io::ErrorKind::BrokenPipe {
                    return Ok(());
                }
                return Err(e.into());
            }
        }
        out.flush()?;
        drop(out);

        if !interval.is_zero() {
            thread::sleep(interval);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use varroa_monitor::parser::{parse_line, ParsedEvent};

    #[test]
    fn test_seeded_output_is_reproducible() {
        let a: Vec<String> = {
            let mut hive = Hive::new(Some(42));
            (1..=20).flat_map(|f| hive.frame(f)).collect()
        };
        let b: Vec<String> = {
            let mut hive = Hive::new(Some(42));
            (1..=20).flat_map(|f| hive.frame(f)).collect()
        };
        assert_eq!(a, b);
    }

    #[test]
    fn test_output_speaks_the_protocol() {
        let mut hive = Hive::new(Some(1));
        let lines = hive.frame(10);
        assert_eq!(lines.len(), 5);
        for line in &lines {
            let outcome = parse_line(line);
            assert_eq!(outcome.events.len(), 1, "{line}");
            assert!(outcome.skipped.is_empty());
        }
        assert_eq!(parse_line(&lines[0]).events, vec![ParsedEvent::FrameCount(10)]);
    }
}
