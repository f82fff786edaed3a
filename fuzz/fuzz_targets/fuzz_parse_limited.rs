#![no_main]

use libfuzzer_sys::fuzz_target;
use std::io::Cursor;

// Same input, tight limits: the depth and memory checks must fail cleanly.
fuzz_target!(|data: &[u8]| {
    let config = heif_box_parse::DecodeConfig::default()
        .with_max_box_depth(4)
        .with_peak_memory_limit(4096);
    let mut src = Cursor::new(data);
    let Ok(tree) = heif_box_parse::BoxTree::from_reader_with_config(&mut src, &config, &enough::Unstoppable) else {
        return;
    };
    if let (Some(iloc), Some(item_id)) = (tree.item_locations(), tree.primary_item_id()) {
        let _ = iloc.read_item_data(item_id, &mut src, &config);
    }
});
