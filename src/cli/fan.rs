use std::io::{self, BufRead, Write};

use eyre::Result;

use crate::hardware::{self, RelayBank};

/// Interactive bench test for a single relay. Reads `on`/`off`/`exit`
/// from stdin and drives the pin directly, bypassing the registry.
pub fn run(pin: u8, active_low: bool) -> Result<()> {
    let mut relays = RelayBank::new(hardware::default_backend(active_low)?);
    relays.initialize(pin);

    let stdin = io::stdin();
    let mut input = String::new();

    loop {
        print!("Enter 'on', 'off' or 'exit': ");
        io::stdout().flush()?;

        input.clear();
        if stdin.lock().read_line(&mut input)? == 0 {
            break;
        }

        match input.trim() {
            "on" => relays.turn_on(pin),
            "off" => relays.turn_off(pin),
            "exit" => break,
            other => println!("Unknown command {other:?}"),
        }
    }

    relays.shutdown_all();
    Ok(())
}
