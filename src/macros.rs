// Copyright 2022 OpenStax Poland
// Licensed under the MIT license. See LICENSE file in the project root for
// full license text.

/// Match a byte string against literal prefixes, ignoring ASCII case
///
/// Arms are tried in order; the first literal that `$value` starts with wins.
/// Several literals can share an arm (`b"EHLO" | b"HELO" => ...`). The final
/// arm must be `_`.
#[macro_export]
macro_rules! match_prefix_ignore_ascii_case {
    (@$value:expr; [$($arms:tt)*] _ => $default:expr $(,)?) => {
        $($arms)* {
            $default
        }
    };

    (@$value:expr; [$($arms:tt)*] $pat:literal $(| $apat:literal)* => { $($body:tt)* } $(,)? $($rest:tt)+) => {
        match_prefix_ignore_ascii_case!(@$value;
            [
                $($arms)*
                if $crate::macros::starts_with_ignore_ascii_case($value, $pat)
                $(|| $crate::macros::starts_with_ignore_ascii_case($value, $apat))* {
                    $($body)*
                } else
            ]
            $($rest)*
        )
    };

    (@$value:expr; [$($arms:tt)*] $pat:literal $(| $apat:literal)* => $arm:expr , $($rest:tt)+) => {
        match_prefix_ignore_ascii_case!(@$value;
            [
                $($arms)*
                if $crate::macros::starts_with_ignore_ascii_case($value, $pat)
                $(|| $crate::macros::starts_with_ignore_ascii_case($value, $apat))* {
                    $arm
                } else
            ]
            $($rest)*
        )
    };

    ($value:expr; $($rest:tt)*) => {
        match_prefix_ignore_ascii_case!(@$value; [] $($rest)*)
    }
}

#[inline]
pub fn starts_with_ignore_ascii_case(value: &[u8], prefix: &[u8]) -> bool {
    value.len() >= prefix.len() && value[..prefix.len()].eq_ignore_ascii_case(prefix)
}
