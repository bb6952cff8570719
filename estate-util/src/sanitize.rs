// Copyright 2024 The NativeLink Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Object key naming: `real_estate/<sanitized idSec>_<index>.jpg`.

/// Replaces any character outside `[A-Za-z0-9._-]` with `_`; an
/// all-invalid (hence empty) input becomes `default_image`.
#[must_use]
pub fn sanitize(raw: &str) -> String {
    let sanitized: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if sanitized.is_empty() || sanitized.chars().all(|c| c == '_') {
        "default_image".to_string()
    } else {
        sanitized
    }
}

/// Builds the object key for the `index`-th image of a listing.
#[must_use]
pub fn object_key(id_sec: &str, index: usize) -> String {
    let name = sanitize(id_sec);
    let name = if name == "default_image" {
        "default_image.jpg".to_string()
    } else {
        format!("{name}_{index}.jpg")
    };
    format!("real_estate/{name}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn replaces_invalid_characters() {
        assert_eq!(sanitize("abc/def 123"), "abc_def_123");
        assert_eq!(sanitize("L-1.2_3"), "L-1.2_3");
    }

    #[test]
    fn empty_after_sanitisation_falls_back_to_default() {
        assert_eq!(sanitize("###"), "default_image");
        assert_eq!(sanitize(""), "default_image");
    }

    #[test]
    fn sanitise_is_idempotent() {
        for raw in ["abc/def", "héllo!!", "already-ok_1.2", ""] {
            let once = sanitize(raw);
            let twice = sanitize(&once);
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn object_key_uses_expected_prefix_and_shape() {
        assert_eq!(object_key("L1", 0), "real_estate/L1_0.jpg");
        assert_eq!(object_key("###", 2), "real_estate/default_image.jpg");
    }
}
