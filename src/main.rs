// Headless runner: boots the machine, runs a program (or the built-in
// raster IRQ demo) for a number of frames and prints what the VIC-II did
// to the CPU.

use std::path::PathBuf;
use std::process::ExitCode;

use phosphor_chipset::c64_emu::c64::{C64, DEMO_COUNTER};
use phosphor_chipset::c64_emu::vic_ii::VicModel;
use phosphor_chipset::config::Config;

const USAGE: &str = "\
usage: phosphor-chipset [--config FILE] [--model NAME] [--frames N] [--start ADDR] [PROGRAM.prg]

  --config FILE   JSON config (default: <config dir>/phosphor-chipset/config.json)
  --model NAME    mos6569|pal, mos6567r8|ntsc, mos6567r56a|old-ntsc
  --frames N      frames to run
  --start ADDR    entry point for PROGRAM (hex, default: its load address)";

// ─────────────────────────────────────────────────────────────────────────────
//  CLI argument helpers
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Args {
    config: Option<PathBuf>,
    model: Option<VicModel>,
    frames: Option<u32>,
    start: Option<u16>,
    program: Option<PathBuf>,
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut out = Args::default();
    let mut it = args.iter();
    while let Some(arg) = it.next() {
        let mut value = |name: &str| {
            it.next()
                .cloned()
                .ok_or_else(|| format!("{name} needs a value"))
        };
        match arg.as_str() {
            "--config" => out.config = Some(PathBuf::from(value("--config")?)),
            "--model" => out.model = Some(parse_model(&value("--model")?)?),
            "--frames" => {
                let v = value("--frames")?;
                out.frames = Some(v.parse().map_err(|_| format!("bad frame count '{v}'"))?);
            }
            "--start" => {
                let v = value("--start")?;
                out.start = Some(parse_hex_addr(&v).ok_or_else(|| format!("bad address '{v}'"))?);
            }
            s if s.starts_with("--") => return Err(format!("unknown option {s}")),
            _ => out.program = Some(PathBuf::from(arg)),
        }
    }
    Ok(out)
}

fn parse_model(name: &str) -> Result<VicModel, String> {
    serde_json::from_value(serde_json::Value::String(name.to_ascii_lowercase()))
        .map_err(|_| format!("unknown VIC-II model '{name}'"))
}

fn parse_hex_addr(s: &str) -> Option<u16> {
    let s = s.trim();
    let hex = if let Some(h) = s.strip_prefix('$') {
        h
    } else if let Some(h) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        h
    } else {
        s
    };
    u16::from_str_radix(hex, 16).ok()
}

// ─────────────────────────────────────────────────────────────────────────────
//  Run
// ─────────────────────────────────────────────────────────────────────────────

fn run(args: Args) -> Result<(), String> {
    let mut config = match &args.config {
        Some(path) => Config::load_from(path).map_err(|e| format!("{}: {e}", path.display()))?,
        None => Config::load(),
    };
    if let Some(model) = args.model {
        config.vic_model = model;
    }
    if let Some(frames) = args.frames {
        config.frames = frames;
    }
    if args.program.is_some() {
        config.program = args.program;
    }

    let mut c64 = C64::new(config.vic_model);
    let demo = match &config.program {
        Some(path) => {
            let prg = std::fs::read(path).map_err(|e| format!("{}: {e}", path.display()))?;
            let load = c64.load_prg(&prg)?;
            c64.set_reset_vector(args.start.unwrap_or(load));
            false
        }
        None => {
            log::info!("No program given, running the raster IRQ demo");
            c64.install_demo();
            true
        }
    };
    c64.reset();

    for frame in 1..=config.frames {
        c64.run_frames(1).map_err(|e| e.to_string())?;
        if config.report_interval > 0 && frame % config.report_interval == 0 {
            let s = c64.stats();
            log::info!(
                "frame {frame}: {} cycles, {} stolen, {} IRQs",
                s.cycles,
                s.stolen_cycles,
                s.irqs_taken
            );
        }
    }

    let s = c64.stats();
    println!("model:         {:?}", c64.model());
    println!("frames:        {}", config.frames);
    println!("cycles:        {} ({} ms)", s.cycles, c64.get_time_ms());
    println!("instructions:  {}", s.instructions);
    println!("stolen cycles: {}", s.stolen_cycles);
    println!("irqs taken:    {} ({} edges)", s.irqs_taken, s.irq_edges);
    println!("raster:        line {} cycle {}", s.raster_y, s.raster_x);
    if demo {
        println!("frame counter: {}", c64.peek(DEMO_COUNTER));
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
//  Entry point
// ─────────────────────────────────────────────────────────────────────────────

fn main() -> ExitCode {
    env_logger::init();

    let argv: Vec<String> = std::env::args().skip(1).collect();
    if argv.iter().any(|a| a == "--help" || a == "-h") {
        println!("{USAGE}");
        return ExitCode::SUCCESS;
    }

    let result = parse_args(&argv).and_then(run);
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("[phosphor-chipset] {e}");
            eprintln!("{USAGE}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_args() {
        let a = parse_args(&args(&["--model", "NTSC", "--frames", "3", "--start", "$C000", "tune.prg"]))
            .unwrap();
        assert_eq!(a.model, Some(VicModel::Mos6567R8));
        assert_eq!(a.frames, Some(3));
        assert_eq!(a.start, Some(0xC000));
        assert_eq!(a.program, Some(PathBuf::from("tune.prg")));
        assert!(a.config.is_none());
    }

    #[test]
    fn test_parse_args_errors() {
        assert!(parse_args(&args(&["--frames"])).is_err());
        assert!(parse_args(&args(&["--model", "vic20"])).is_err());
        assert!(parse_args(&args(&["--stereo"])).is_err());
    }

    #[test]
    fn test_parse_hex_addr() {
        assert_eq!(parse_hex_addr("0x0801"), Some(0x0801));
        assert_eq!(parse_hex_addr("$1000"), Some(0x1000));
        assert_eq!(parse_hex_addr("c000"), Some(0xC000));
        assert_eq!(parse_hex_addr("xyz"), None);
    }
}
