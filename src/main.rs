//! remod CLI: convert Deflemask DMF modules to ProTracker MOD.
//!
//! Usage:
//!   remod input.dmf output.mod
//!   remod --arp --port --downsample input.dmf output.mod

use std::path::Path;
use std::{env, fs, process};

use remod_formats::{new_module, new_options, option_definitions, Module, ModuleKind};
use remod_ir::OptionValue;

fn usage() -> ! {
    eprintln!("Usage: remod [options] <input.dmf> <output.mod>");
    eprintln!();
    eprintln!("Options:");
    for definition in option_definitions() {
        eprintln!("  --{:<12} {}", definition.name, definition.description);
    }
    eprintln!("  --{:<12} Overwrite the output file if it exists", "force");
    eprintln!("  --{:<12} Print diagnostic information while converting", "verbose");
    process::exit(1);
}

fn print_status(module: &Module) {
    for warning in module.status().warnings() {
        eprintln!("{warning}");
    }
    if let Some(error) = module.status().error() {
        eprintln!("{error}");
    }
}

fn kind_from_path(path: &str) -> Option<ModuleKind> {
    Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .and_then(ModuleKind::from_extension)
}

fn main() {
    let args: Vec<String> = env::args().skip(1).collect();

    let mut force = false;
    let mut verbose = false;
    let mut files: Vec<&str> = Vec::new();
    let mut flags: Vec<&str> = Vec::new();
    let mut tempo: Option<&str> = None;

    for arg in &args {
        if let Some(name) = arg.strip_prefix("--") {
            match name {
                "force" => force = true,
                "verbose" => verbose = true,
                "help" => usage(),
                _ => {
                    if let Some(value) = name.strip_prefix("tempo=") {
                        tempo = Some(value);
                    } else {
                        // May belong to another layer; note it and move on
                        flags.push(name);
                    }
                }
            }
        } else {
            files.push(arg.as_str());
        }
    }

    env_logger::Builder::new()
        .filter_level(if verbose { log::LevelFilter::Debug } else { log::LevelFilter::Warn })
        .format_timestamp(None)
        .init();

    let (input_path, output_path) = match files.as_slice() {
        [input, output] => (*input, *output),
        _ => usage(),
    };

    let input_kind = kind_from_path(input_path).unwrap_or_else(|| {
        eprintln!("Unrecognized input file extension; a .dmf file is expected.");
        process::exit(1);
    });
    let output_kind = kind_from_path(output_path).unwrap_or_else(|| {
        eprintln!("Unrecognized output file extension; a .mod file is expected.");
        process::exit(1);
    });

    // Collect the output format's conversion options from the flags
    let definitions = option_definitions();
    let mut options = new_options(output_kind);
    for flag in flags {
        if options.set(&definitions, flag, OptionValue::Bool(true)).is_err() {
            eprintln!("WARNING: Ignoring unrecognized option: --{flag}");
        }
    }
    if let Some(value) = tempo {
        if let Err(error) = options.set(&definitions, "tempo", OptionValue::Str(value.to_string())) {
            eprintln!("{error}");
            process::exit(1);
        }
    }

    if !force && fs::metadata(output_path).is_ok() {
        eprintln!("Output file already exists; use --force to overwrite it.");
        process::exit(1);
    }

    let data = fs::read(input_path).unwrap_or_else(|error| {
        eprintln!("Failed to read {input_path}: {error}");
        process::exit(1);
    });

    let mut input = new_module(input_kind);
    if input.import(&data).is_err() {
        print_status(&input);
        process::exit(1);
    }
    print_status(&input);

    let mut output = match input.convert(output_kind, &options) {
        Ok(output) => output,
        Err(_) => {
            print_status(&input);
            process::exit(1);
        }
    };
    print_status(&output);

    let bytes = match output.export() {
        Ok(bytes) => bytes,
        Err(_) => {
            print_status(&output);
            process::exit(1);
        }
    };

    if let Err(error) = fs::write(output_path, bytes) {
        eprintln!("Failed to write {output_path}: {error}");
        process::exit(1);
    }
}
