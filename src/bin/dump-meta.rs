//! Prints the metadata graph of a managed module without loading it.

use std::path::PathBuf;

use clap::Parser;

use ulr_rs::assembly::Assembly;
use ulr_rs::error::RuntimeError;
use ulr_rs::metadata::MetaReader;

#[derive(Parser)]
#[command(about = "Dump the parsed metadata of a managed module")]
struct Args {
    module: PathBuf,
}

fn main() -> Result<(), RuntimeError> {
    let args = Args::parse();
    let assembly = Assembly::from_library(&args.module).map_err(RuntimeError::Load)?;
    println!("{}: {} address slots", assembly.name, assembly.addresses.len());

    let mut reader = MetaReader::new(assembly.meta);
    let mut slot = 0usize;
    while !reader.at_end() {
        let header = reader.read_type_header().map_err(RuntimeError::Metadata)?;
        println!(
            "{:?} {} (size {}, {:?})",
            header.kind, header.qualified_name, header.size, header.modifiers
        );
        while let Some(member) = reader.next_member().map_err(RuntimeError::Metadata)? {
            let addr = assembly.addresses.get(slot).copied().unwrap_or_default();
            println!("  [{slot:3}] {addr:#014x} {member:?}");
            slot += 1;
        }
    }
    Ok(())
}
