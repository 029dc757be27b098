#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use stampede_core::{Fingerprinter, Method, RequestDescriptor, Sha256Fingerprinter};

#[derive(Arbitrary, Debug)]
struct Input {
    method: String,
    path: String,
    query: Vec<(String, String)>,
    body: Option<Vec<u8>>,
}

fuzz_target!(|input: Input| {
    let Ok(method) = input.method.parse::<Method>() else {
        return;
    };

    let mut request =
        RequestDescriptor::new(method.clone(), &input.path).with_query(input.query.clone());
    if let Some(body) = &input.body {
        request = request.with_body(body.clone());
    }

    let Ok(key) = Sha256Fingerprinter.fingerprint(&request) else {
        return;
    };

    // Deterministic
    assert_eq!(Sha256Fingerprinter.fingerprint(&request).ok(), Some(key));

    // Query order is irrelevant
    let mut reversed = input.query;
    reversed.reverse();
    let mut shuffled = RequestDescriptor::new(method.clone(), &input.path).with_query(reversed);
    if let Some(body) = &input.body {
        shuffled = shuffled.with_body(body.clone());
    }
    assert_eq!(Sha256Fingerprinter.fingerprint(&shuffled).ok(), Some(key));

    // Bodies only count for body-bearing methods
    if !method.carries_body() {
        let bare =
            RequestDescriptor::new(method, &input.path).with_query(request.query().to_vec());
        assert_eq!(Sha256Fingerprinter.fingerprint(&bare).ok(), Some(key));
    }
});
