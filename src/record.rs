//! Sortable record interface.

/// A unit of data produced by parsing one input line.
///
/// The rendered form must be canonical: parsing the rendered text back has to yield an equal record, otherwise
/// merged output is not stable across runs. Ordering is not part of this trait, it is passed to the sorter and
/// the merger as a compare function so the same record type can be sorted in different orders.
pub trait Record: Send {
    /// Returns the canonical text form of the record.
    fn render(&self) -> String;
}

impl Record for String {
    fn render(&self) -> String {
        self.clone()
    }
}

macro_rules! impl_display_record {
    ($($ty:ty),*) => {
        $(
            impl Record for $ty {
                fn render(&self) -> String {
                    self.to_string()
                }
            }
        )*
    };
}

impl_display_record!(i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize);
