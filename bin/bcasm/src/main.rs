use bcasm::serialize::{deserialize, serialize};
use bcasm::*;

use clap::{Arg, ArgAction, ArgMatches, Command};
use std::fs;

fn main() -> Result<(), Error> {
    env_logger::init();

    let matches = Command::new("Structured bytecode assembler")
        .version("0.1.0")
        .author("Alec Theriault <alec.theriault@gmail.com>")
        .about("Record, replay, and disassemble programs of the sample language")
        .subcommand_required(true)
        .arg(
            Arg::new("no-source-info")
                .long("no-source-info")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Do not record source sections in the bytecode"),
        )
        .arg(
            Arg::new("no-tags")
                .long("no-tags")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Do not instrument tags or instrumentation operations"),
        )
        .subcommand(
            Command::new("sample")
                .about("Serialize the builder calls of the sample program")
                .arg(
                    Arg::new("OUTPUT")
                        .help("Sets the output file for the serialized calls")
                        .required(true)
                        .index(1),
                ),
        )
        .subcommand(
            Command::new("dump")
                .about("Replay serialized builder calls and print the resulting bytecode")
                .arg(
                    Arg::new("INPUT")
                        .help("Sets the input file of serialized calls")
                        .required(true)
                        .index(1),
                ),
        )
        .get_matches();

    let model = sample::model()?;
    match matches.subcommand() {
        Some(("sample", sub_matches)) => {
            let output = required(sub_matches, "OUTPUT")?;
            let bytes = serialize(&model, vec![], sample::program)?;
            log::info!("Writing {} bytes of builder calls to '{}'", bytes.len(), output);
            fs::write(output, bytes).map_err(Error::IoError)?;
        }
        Some(("dump", sub_matches)) => {
            let input = required(sub_matches, "INPUT")?;
            log::info!("Replaying '{}'", input);
            let bytes = fs::read(input).map_err(Error::IoError)?;

            let config = config(&matches);
            let mut pool = config.pool();
            let mut builder = Builder::new(&model, config, &mut pool);
            deserialize(&bytes, &mut builder)?;
            let nodes = builder.finish()?;
            print!("{}", nodes.disassemble(&model)?);
        }
        _ => unreachable!("a subcommand is required"),
    }

    Ok(())
}

fn required<'a>(matches: &'a ArgMatches, name: &str) -> Result<&'a String, Error> {
    matches
        .get_one::<String>(name)
        .ok_or_else(|| Error::IllegalArgument(format!("missing {}", name)))
}

fn config(matches: &ArgMatches) -> BuilderConfig {
    let mut config = BuilderConfig::default();
    if matches.get_flag("no-source-info") {
        config.source_info = false;
    }
    if matches.get_flag("no-tags") {
        config.instrumented_tags = TagMask::NONE;
        config.instrumentations = 0;
    }
    config
}
