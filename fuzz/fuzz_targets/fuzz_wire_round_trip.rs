#![no_main]

use libfuzzer_sys::fuzz_target;
use querykit::{Expr, are_equal};

// Serialization is lossless for every representable tree.
fuzz_target!(|data: &[u8]| {
    let Ok(tree) = serde_json::from_slice::<Expr>(data) else {
        return;
    };
    let wire = serde_json::to_string(&tree).expect("trees serialize");
    let back: Expr = serde_json::from_str(&wire).expect("serialized trees deserialize");
    assert!(are_equal(&tree, &back));
});
