use std::fmt::Write;

/// A value that can identify a query.
///
/// Keys are normalized into a canonical string which is used for cache lookups
/// and fetch deduplication. Scalars are written as-is, sequences and tuples are
/// written as `[a,b,...]` with each element normalized recursively. Characters
/// with structural meaning (`[`, `]`, `,` and `\`) are escaped inside strings, so
/// two different structures never produce the same key.
///
/// Implement this trait for your own key types. The canonical form you write
/// must be collision free among values that should not share a cache entry.
///
/// ```
/// use zen_query::normalize;
///
/// assert_eq!(normalize("todos"), "todos");
/// assert_eq!(normalize(&("todo", 5)), "[todo,5]");
/// assert_eq!(normalize(&vec![vec![1, 2], vec![3]]), "[[1,2],[3]]");
/// ```
pub trait QueryKey {
    /// Appends the canonical form of this key to `out`.
    fn write_key(&self, out: &mut String);
}

/// Converts a key into its canonical string.
pub fn normalize<K: QueryKey + ?Sized>(key: &K) -> String {
    let mut out = String::new();
    key.write_key(&mut out);
    out
}

fn write_escaped(value: &str, out: &mut String) {
    for c in value.chars() {
        if matches!(c, '[' | ']' | ',' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
}

fn write_sequence<'a, K, I>(items: I, out: &mut String)
where
    K: QueryKey + 'a,
    I: IntoIterator<Item = &'a K>,
{
    out.push('[');
    for (index, item) in items.into_iter().enumerate() {
        if index > 0 {
            out.push(',');
        }
        item.write_key(out);
    }
    out.push(']');
}

macro_rules! display_key {
    ($($ty:ty),*) => {
        $(
            impl QueryKey for $ty {
                fn write_key(&self, out: &mut String) {
                    let _ = write!(out, "{}", self);
                }
            }
        )*
    };
}

display_key!(
    i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, f32, f64, bool
);

impl QueryKey for char {
    fn write_key(&self, out: &mut String) {
        let mut buf = [0u8; 4];
        write_escaped(self.encode_utf8(&mut buf), out);
    }
}

impl QueryKey for str {
    fn write_key(&self, out: &mut String) {
        write_escaped(self, out);
    }
}

impl QueryKey for String {
    fn write_key(&self, out: &mut String) {
        write_escaped(self, out);
    }
}

/// A key that is already in canonical form.
pub(crate) struct Normalized<'a>(pub &'a str);

impl QueryKey for Normalized<'_> {
    fn write_key(&self, out: &mut String) {
        out.push_str(self.0);
    }
}

impl<K: QueryKey + ?Sized> QueryKey for &K {
    fn write_key(&self, out: &mut String) {
        (**self).write_key(out);
    }
}

impl<K: QueryKey + ?Sized> QueryKey for Box<K> {
    fn write_key(&self, out: &mut String) {
        (**self).write_key(out);
    }
}

impl<K: QueryKey> QueryKey for Option<K> {
    fn write_key(&self, out: &mut String) {
        match self {
            Some(key) => key.write_key(out),
            // Escaped strings never contain a backslash followed by `n`.
            None => out.push_str("\\null"),
        }
    }
}

impl<K: QueryKey> QueryKey for [K] {
    fn write_key(&self, out: &mut String) {
        write_sequence(self.iter(), out);
    }
}

impl<K: QueryKey, const N: usize> QueryKey for [K; N] {
    fn write_key(&self, out: &mut String) {
        write_sequence(self.iter(), out);
    }
}

impl<K: QueryKey> QueryKey for Vec<K> {
    fn write_key(&self, out: &mut String) {
        write_sequence(self.iter(), out);
    }
}

macro_rules! tuple_key {
    ($($name:ident : $idx:tt),+) => {
        impl<$($name: QueryKey),+> QueryKey for ($($name,)+) {
            fn write_key(&self, out: &mut String) {
                out.push('[');
                $(
                    if $idx > 0 {
                        out.push(',');
                    }
                    self.$idx.write_key(out);
                )+
                out.push(']');
            }
        }
    };
}

tuple_key!(A: 0);
tuple_key!(A: 0, B: 1);
tuple_key!(A: 0, B: 1, C: 2);
tuple_key!(A: 0, B: 1, C: 2, D: 3);
tuple_key!(A: 0, B: 1, C: 2, D: 3, E: 4);
tuple_key!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5);
