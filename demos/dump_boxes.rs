//! Dump the box tree of a HEIF file, and optionally write the primary
//! image as an HEVC elementary stream.
use std::env;
use std::fs::File;
use std::io::Write;

use heif_box_parse::{BoxTree, DecodeConfig, Unstoppable};

fn main() {
    env_logger::init();
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <heif-file> [output.h265]", args[0]);
        std::process::exit(1);
    }

    let path = &args[1];
    let mut f = File::open(path).expect("Failed to open file");
    let config = DecodeConfig::default();

    let tree = match BoxTree::from_reader_with_config(&mut f, &config, &Unstoppable) {
        Ok(tree) => tree,
        Err(e) => {
            eprintln!("Parse error: {}", e);
            std::process::exit(1);
        }
    };
    print!("{}", tree);
    if let Some(e) = tree.error() {
        eprintln!("Warning: {} ({} boxes decoded)", e, tree.len());
    }

    let Some(out_path) = args.get(2) else {
        return;
    };
    let Some(item_id) = tree.primary_item_id() else {
        eprintln!("No primary item");
        std::process::exit(1);
    };

    let mut stream = Vec::new();
    let hvcc = tree
        .item_properties(item_id.into())
        .find_map(|(id, _)| tree.get(id)?.as_hvcc());
    match hvcc {
        Some(hvcc) => stream.extend_from_slice(&hvcc.get_headers(&config).expect("hvcC headers")),
        None => eprintln!("Primary item has no hvcC, writing slice data only"),
    }

    let iloc = tree.item_locations().expect("No iloc box");
    match iloc.read_item_data(item_id, &mut f, &config) {
        Ok(Some(data)) => {
            for failed in data.failed_extents.iter() {
                eprintln!("Extent {} of item {} is corrupt", failed.extent_index, failed.item_id);
            }
            stream.extend_from_slice(&data.data);
        }
        Ok(None) => eprintln!("Item {} has no location", item_id),
        Err(e) => {
            eprintln!("Reading item {}: {}", item_id, e);
            std::process::exit(1);
        }
    }

    File::create(out_path)
        .and_then(|mut out| out.write_all(&stream))
        .expect("Failed to write output");
    println!("Wrote {} bytes to {}", stream.len(), out_path);
}
