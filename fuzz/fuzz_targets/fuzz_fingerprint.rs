#![no_main]

use libfuzzer_sys::fuzz_target;

use vocu_tts::synthesis::{OptionValue, SynthesisRequest};

fuzz_target!(|data: &str| {
    // Line 1 is the text, line 2 the voice id, the rest `key=value` options.
    let mut lines = data.split('\n');
    let text = lines.next().unwrap_or_default();
    let voice = lines.next().unwrap_or_default();
    let mut request = SynthesisRequest::new(text, voice);
    for line in lines {
        if let Some((key, value)) = line.split_once('=') {
            request = request.with_option(key, OptionValue::parse(value));
        }
    }

    let Ok(normalized) = request.normalize() else {
        return;
    };

    // Normalizing is deterministic and idempotent.
    let again = request.normalize().expect("second normalize");
    assert_eq!(normalized.fingerprint(), again.fingerprint());

    let mut rebuilt = SynthesisRequest::new(normalized.text(), normalized.voice_id());
    for (key, value) in normalized.options() {
        rebuilt = rebuilt.with_option(key.as_str(), value.clone());
    }
    let rebuilt = rebuilt.normalize().expect("normalized request stays valid");
    assert_eq!(normalized.fingerprint(), rebuilt.fingerprint());
    assert_eq!(normalized.fingerprint().as_str().len(), 64);
});
