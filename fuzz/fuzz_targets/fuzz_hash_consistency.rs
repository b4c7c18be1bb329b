#![no_main]

use libfuzzer_sys::fuzz_target;
use querykit::{Expr, are_equal, structural_hash};

// Equal trees must hash identically; a tree always equals a deep copy of
// itself.
fuzz_target!(|data: &[u8]| {
    let Ok(tree) = serde_json::from_slice::<Expr>(data) else {
        return;
    };
    let copy = tree.clone();
    assert!(are_equal(&tree, &copy));
    assert_eq!(structural_hash(&tree), structural_hash(&copy));
});
