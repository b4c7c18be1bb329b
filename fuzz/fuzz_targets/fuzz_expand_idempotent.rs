#![no_main]

use std::sync::Arc;

use libfuzzer_sys::fuzz_target;
use querykit::{Expr, are_equal, expand};

// Arbitrary JSON bytes that happen to deserialize into a tree must expand
// idempotently: a second pass over the first pass's output is a no-op.
fuzz_target!(|data: &[u8]| {
    let Ok(tree) = serde_json::from_slice::<Expr>(data) else {
        return;
    };
    let tree = Arc::new(tree);
    let Ok(once) = expand(&tree) else {
        return;
    };
    let twice = expand(&once).expect("expanding expanded output cannot fail");
    assert!(are_equal(&once, &twice));
});
