#![no_main]

use libfuzzer_sys::fuzz_target;
use std::io::Cursor;

fuzz_target!(|data: &[u8]| {
    let mut src = Cursor::new(data);
    let Ok(tree) = heif_box_parse::read_box_tree(&mut src) else {
        return;
    };
    let _ = tree.to_string();

    let config = heif_box_parse::DecodeConfig::default();
    if let Some(iloc) = tree.item_locations() {
        let _ = iloc.read_all_data(&mut src, &config);
    }
    for &id in tree.top_level() {
        walk(&tree, id, &config);
    }
});

fn walk(tree: &heif_box_parse::BoxTree, id: heif_box_parse::BoxId, config: &heif_box_parse::DecodeConfig) {
    if let Some(hvcc) = tree.get(id).and_then(|node| node.as_hvcc()) {
        let _ = hvcc.get_headers(config);
    }
    for &child in tree.children(id) {
        walk(tree, child, config);
    }
}
