//! A minimal dependency-renaming tool using elf-rewriter's ElfImage
//!
//! Supported operations:
//! - `--replace-needed LIBRARY NEW_LIBRARY`: rename a DT_NEEDED entry
//!   (repeatable; version-requirement entries are renamed along with it)
//! - `--output FILE`: write the result to FILE instead of in place
//! - `--debug`: trace the layout rewrite on stderr

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::process;

use elf_rewriter::ElfImage;

fn print_usage(program: &str) {
    eprintln!("syntax: {program}");
    eprintln!("  [--replace-needed LIBRARY NEW_LIBRARY]");
    eprintln!("  [--output FILE]");
    eprintln!("  [--debug]");
    eprintln!("  FILENAME...");
    eprintln!();
    eprintln!("Examples:");
    eprintln!("  {program} --replace-needed libssl.so.1.1 libssl.so.3 ./mybinary");
    eprintln!("  {program} --replace-needed libfoo.so libbar.so --output patched ./mybinary");
}

fn patch_file(
    file_name: &str,
    output_name: Option<&str>,
    libs: &BTreeMap<String, String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let data = fs::read(file_name)?;

    let mut image = ElfImage::parse(data)?;
    image.replace_needed(libs)?;
    image.commit(false)?;

    // The file is always written back: the rewritten bytes if something
    // changed, the original bytes otherwise.
    match output_name {
        Some(output) => {
            fs::write(output, image.bytes())?;
            println!("Output written to: {output}");
        }
        None => {
            fs::write(file_name, image.bytes())?;
            if image.is_changed() {
                println!("Patched: {file_name}");
            } else {
                println!("Not modified: {file_name}");
            }
        }
    }

    Ok(())
}

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() <= 1 {
        print_usage(&args[0]);
        process::exit(1);
    }

    let mut libs: BTreeMap<String, String> = BTreeMap::new();
    let mut output_name: Option<String> = None;
    let mut file_names: Vec<String> = Vec::new();
    let mut debug = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--replace-needed" => {
                if i + 2 >= args.len() {
                    eprintln!("Error: --replace-needed requires two arguments");
                    print_usage(&args[0]);
                    process::exit(1);
                }
                libs.insert(args[i + 1].clone(), args[i + 2].clone());
                i += 3;
            }
            "--output" => {
                if i + 1 >= args.len() {
                    eprintln!("Error: --output requires an argument");
                    print_usage(&args[0]);
                    process::exit(1);
                }
                output_name = Some(args[i + 1].clone());
                i += 2;
            }
            "--debug" => {
                debug = true;
                i += 1;
            }
            arg if arg.starts_with("--") => {
                eprintln!("Error: Unknown option '{arg}'");
                print_usage(&args[0]);
                process::exit(1);
            }
            arg => {
                file_names.push(arg.to_string());
                i += 1;
            }
        }
    }

    env_logger::Builder::new()
        .filter_level(if debug {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Warn
        })
        .init();

    if file_names.is_empty() {
        eprintln!("Error: missing filename");
        process::exit(1);
    }

    if output_name.is_some() && file_names.len() != 1 {
        eprintln!("Error: --output only allowed with a single input file");
        process::exit(1);
    }

    for file_name in &file_names {
        if let Err(e) = patch_file(file_name, output_name.as_deref(), &libs) {
            eprintln!("{}: {e}", args[0]);
            process::exit(1);
        }
    }
}
