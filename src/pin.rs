//! WPS PIN sourcing.
//!
//! The enrolment PIN either comes from the configuration verbatim or from
//! an external supplier program that prints a fresh PIN per invocation.

use std::process::Command;

use tracing::{debug, error};

use crate::redact;

/// Supplies the PIN used for keypad enrolment. Called once per enrolment
/// attempt; `previous` is the PIN handed out on the last call.
pub trait PinSupplier: Send {
    fn supply_pin(&mut self, previous: &str) -> String;
}

/// Fixed PIN taken from the configuration.
pub struct StaticPin;

impl PinSupplier for StaticPin {
    fn supply_pin(&mut self, previous: &str) -> String {
        previous.to_string()
    }
}

/// External supplier program; its first stdout line is the next PIN.
/// Falls back to the previous PIN when the program fails.
pub struct ProgramPin {
    program: String,
}

impl ProgramPin {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl PinSupplier for ProgramPin {
    fn supply_pin(&mut self, previous: &str) -> String {
        let output = match Command::new("sh").arg("-c").arg(&self.program).output() {
            Ok(output) => output,
            Err(e) => {
                error!("pin program {:?} failed to run: {e}", self.program);
                return previous.to_string();
            }
        };
        if !output.status.success() {
            error!(
                "pin program {:?} exited with {}",
                self.program, output.status
            );
            return previous.to_string();
        }
        let pin = String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()
            .unwrap_or_default()
            .trim()
            .to_string();
        if pin.is_empty() {
            error!("pin program {:?} printed no PIN", self.program);
            return previous.to_string();
        }
        debug!("pin program supplied a new PIN");
        pin
    }
}

/// Draw the next PIN from `supplier` and shield it from the log output.
pub fn next_pin(supplier: &mut dyn PinSupplier, previous: &str) -> String {
    let pin = supplier.supply_pin(previous);
    redact::register_secret(&pin);
    pin
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_pin_returns_configured_value() {
        let mut supplier = StaticPin;
        assert_eq!(supplier.supply_pin("00000000"), "00000000");
    }

    #[test]
    fn program_pin_reads_first_line() {
        let mut supplier = ProgramPin::new("printf '12345670\\nignored\\n'");
        assert_eq!(supplier.supply_pin("00000000"), "12345670");
    }

    #[test]
    fn failing_program_keeps_previous_pin() {
        let mut supplier = ProgramPin::new("exit 1");
        assert_eq!(supplier.supply_pin("00000000"), "00000000");
    }
}
