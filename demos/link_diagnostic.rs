// Link diagnostic: check the master and every board answer on the bus
//
// Only declares read sets and reads registers. Faults are reported, never
// cleared, and no motor is commanded.
//
// Usage: cargo run --example link_diagnostic -- [port | --sim]
// Example: cargo run --example link_diagnostic -- /dev/ttyACM0

use rover_link::boards::{DriveSteerReader, LiftReader, MasterReader};
use rover_link::config::{DEFAULT_BAUD, DEFAULT_PORT, DRIVE_STEER_ADDRS, LIFT_ADDRS};
use rover_link::messages::{BoardStatus, MotorSnapshot};
use rover_link::protocol::{Bus, SerialTransport, SimulatedRover, Transport};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Setup logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("warn".parse().unwrap()),
        )
        .init();

    let target = std::env::args().nth(1).unwrap_or_else(|| DEFAULT_PORT.to_string());

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║              Rover Link Diagnostic (READ-ONLY)               ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    if target == "--sim" {
        println!("Step 1: Starting simulated rover...");
        diagnose(Bus::new(SimulatedRover::default()))
    } else {
        println!("Step 1: Opening {} at {} baud...", target, DEFAULT_BAUD);
        match SerialTransport::connect(&target, DEFAULT_BAUD) {
            Ok(t) => {
                println!("  ✓ Master said Ready");
                diagnose(Bus::new(t))
            }
            Err(e) => {
                println!("  ✗ {}", e);
                println!();
                println!("Troubleshooting:");
                println!("  - Check the port path is correct");
                println!("  - The master must print \"Ready\" after a DTR reset");
                Err(e.into())
            }
        }
    }
}

fn diagnose<T: Transport>(mut bus: Bus<T>) -> Result<(), Box<dyn std::error::Error>> {
    println!();
    println!("Step 2: Declaring read sets...");
    let mut master = MasterReader::new();
    let mut drive_steer: Vec<_> = DRIVE_STEER_ADDRS.iter().map(|&a| DriveSteerReader::new(a)).collect();
    let mut lift: Vec<_> = LIFT_ADDRS.iter().map(|&a| LiftReader::new(a)).collect();
    master.declare_read_set(&mut bus)?;
    drive_steer[0].declare_read_set(&mut bus)?;
    lift[0].declare_read_set(&mut bus)?;
    println!("  ✓ Master accepted all three");
    println!();

    println!("Step 3: Reading boards...");
    println!();
    match master.read(&mut bus) {
        Ok(m) => {
            println!("  === Master ===");
            println!("    Temperatures: {:.1?}", m.temperatures);
            println!("    Fault:        {:?}", m.fault);
        }
        Err(e) => println!("  Master: ERROR - {}", e),
    }
    println!();

    for board in &mut drive_steer {
        println!("  === Drive/steer {} ===", board.address());
        match board.read(&mut bus) {
            Ok(s) => {
                print_status(&s.status);
                println!("    Chassis:  {}", s.chassis);
                print_motor("Drive", &s.drive);
                print_motor("Steer", &s.steer);
            }
            Err(e) => println!("    ERROR - {}", e),
        }
        recover(&mut bus)?;
        println!();
    }

    for board in &mut lift {
        println!("  === Lift {} ===", board.address());
        match board.read(&mut bus) {
            Ok(s) => {
                print_status(&s.status);
                print_motor("Lift 1", &s.motors[0]);
                print_motor("Lift 2", &s.motors[1]);
            }
            Err(e) => println!("    ERROR - {}", e),
        }
        recover(&mut bus)?;
        println!();
    }

    println!("Boot faults are expected until the runtime resets them.");
    Ok(())
}

/// Keep going past a silent board
fn recover<T: Transport>(bus: &mut Bus<T>) -> Result<(), Box<dyn std::error::Error>> {
    if bus.is_timed_out() {
        bus.clear_timeout()?;
    }
    Ok(())
}

fn print_status(s: &BoardStatus) {
    println!("    Timer:    {} ms (bus every {} ms)", s.timer_ms, s.bus_interval_ms);
    match &s.fault {
        Some(f) => println!("    Fault:    {:?} from {:?}", f.kind, f.origin),
        None => println!("    Fault:    none"),
    }
}

fn print_motor(name: &str, m: &MotorSnapshot) {
    println!(
        "    {:<8}  actual {:8.2}  error {:8.2}  control {:3}  current {:4}{}",
        name,
        m.actual,
        m.error,
        m.control,
        m.current,
        if m.faulted { "  FAULTED" } else { "" }
    );
    if let Some(odo) = m.odometry {
        println!("              odometry {}", odo);
    }
}
