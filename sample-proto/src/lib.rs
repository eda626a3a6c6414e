pub mod sample {
    include!("proto/sample.rs");
}
