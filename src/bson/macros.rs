//! Literal construction macros for documents and values.
//!
//! `doc! {"find": "users", "filter": {}, "batchSize": 2i32}` builds a
//! `Document` with the fields in declaration order; `bson!` builds a single
//! `Bson` value. Nested `{...}` and `[...]` literals nest recursively.

/// Construct a `Bson` value from a literal.
#[macro_export]
macro_rules! bson {
    ($($tt:tt)+) => {
        $crate::bson_internal!($($tt)+)
    };
}

/// Construct a `Document` from `"key": value` pairs.
#[macro_export]
macro_rules! doc {
    () => {
        $crate::bson::Document::new()
    };
    ( $($tt:tt)+ ) => {{
        let mut object = $crate::bson::Document::new();
        $crate::bson_internal!(@object object () ($($tt)+) ($($tt)+));
        object
    }};
}

// Token muncher shared by `doc!` and `bson!`. The @array and @object rules
// accumulate parsed elements while peeling tokens off the input; the `$copy`
// parameter keeps an untouched copy of the remaining input for the key-munch
// fallback rule.
#[macro_export]
#[doc(hidden)]
macro_rules! bson_internal {
    //////////////////////////////////////////////////////////////////////////
    // Array munching.
    //////////////////////////////////////////////////////////////////////////

    // Done with trailing comma.
    (@array [$($elems:expr,)*]) => {
        <[_]>::into_vec(::std::boxed::Box::new([$($elems,)*]))
    };

    // Done without trailing comma.
    (@array [$($elems:expr),*]) => {
        <[_]>::into_vec(::std::boxed::Box::new([$($elems),*]))
    };

    // Next element is `null`.
    (@array [$($elems:expr,)*] null $($rest:tt)*) => {
        $crate::bson_internal!(@array [$($elems,)* $crate::bson_internal!(null)] $($rest)*)
    };

    // Next element is an array.
    (@array [$($elems:expr,)*] [$($array:tt)*] $($rest:tt)*) => {
        $crate::bson_internal!(@array [$($elems,)* $crate::bson_internal!([$($array)*])] $($rest)*)
    };

    // Next element is a document.
    (@array [$($elems:expr,)*] {$($map:tt)*} $($rest:tt)*) => {
        $crate::bson_internal!(@array [$($elems,)* $crate::bson_internal!({$($map)*})] $($rest)*)
    };

    // Next element is an expression followed by a comma.
    (@array [$($elems:expr,)*] $next:expr, $($rest:tt)*) => {
        $crate::bson_internal!(@array [$($elems,)* $crate::bson_internal!($next),] $($rest)*)
    };

    // Last element is an expression with no trailing comma.
    (@array [$($elems:expr,)*] $last:expr) => {
        $crate::bson_internal!(@array [$($elems,)* $crate::bson_internal!($last)])
    };

    // Comma after the most recent element.
    (@array [$($elems:expr),*] , $($rest:tt)*) => {
        $crate::bson_internal!(@array [$($elems,)*] $($rest)*)
    };

    //////////////////////////////////////////////////////////////////////////
    // Object munching.
    //////////////////////////////////////////////////////////////////////////

    // Done.
    (@object $object:ident () () ()) => {};

    // Insert the current entry followed by a trailing comma.
    (@object $object:ident [$($key:tt)+] ($value:expr) , $($rest:tt)*) => {
        $object.insert(($($key)+), $value);
        $crate::bson_internal!(@object $object () ($($rest)*) ($($rest)*));
    };

    // Insert the last entry without a trailing comma.
    (@object $object:ident [$($key:tt)+] ($value:expr)) => {
        $object.insert(($($key)+), $value);
    };

    // Next value is `null`.
    (@object $object:ident ($($key:tt)+) (: null $($rest:tt)*) $copy:tt) => {
        $crate::bson_internal!(@object $object [$($key)+] ($crate::bson_internal!(null)) $($rest)*);
    };

    // Next value is an array.
    (@object $object:ident ($($key:tt)+) (: [$($array:tt)*] $($rest:tt)*) $copy:tt) => {
        $crate::bson_internal!(@object $object [$($key)+] ($crate::bson_internal!([$($array)*])) $($rest)*);
    };

    // Next value is a document.
    (@object $object:ident ($($key:tt)+) (: {$($map:tt)*} $($rest:tt)*) $copy:tt) => {
        $crate::bson_internal!(@object $object [$($key)+] ($crate::bson_internal!({$($map)*})) $($rest)*);
    };

    // Next value is an expression followed by a comma.
    (@object $object:ident ($($key:tt)+) (: $value:expr , $($rest:tt)*) $copy:tt) => {
        $crate::bson_internal!(@object $object [$($key)+] ($crate::bson_internal!($value)) , $($rest)*);
    };

    // Last value is an expression with no trailing comma.
    (@object $object:ident ($($key:tt)+) (: $value:expr) $copy:tt) => {
        $crate::bson_internal!(@object $object [$($key)+] ($crate::bson_internal!($value)));
    };

    // Munch a token into the current key.
    (@object $object:ident ($($key:tt)*) ($tt:tt $($rest:tt)*) $copy:tt) => {
        $crate::bson_internal!(@object $object ($($key)* $tt) ($($rest)*) ($($rest)*));
    };

    //////////////////////////////////////////////////////////////////////////
    // Primary entry points.
    //////////////////////////////////////////////////////////////////////////

    (null) => {
        $crate::bson::Bson::Null
    };

    ([]) => {
        $crate::bson::Bson::Array(::std::vec::Vec::new())
    };

    ([ $($tt:tt)+ ]) => {
        $crate::bson::Bson::Array($crate::bson_internal!(@array [] $($tt)+))
    };

    ({}) => {
        $crate::bson::Bson::Document($crate::bson::Document::new())
    };

    ({ $($tt:tt)+ }) => {
        $crate::bson::Bson::Document($crate::doc!($($tt)+))
    };

    ($other:expr) => {
        $crate::bson::Bson::from($other)
    };
}
