#![no_main]
use h5chunk::{Section, SectionPartial};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(partial) = text.parse::<SectionPartial>() {
        let shape = vec![17i64; partial.ranges().len()];
        if let Ok(section) = SectionPartial::fill(Some(&partial), &shape) {
            let _ = section.check_in(&shape);
            let _ = section.total_elements();
        }
    }
    let _ = text.parse::<Section>();
});
