////////////////
// Row macros //
////////////////

/// Assert that every `(buffer, width)` pair holds exactly `n` rows
///
/// Per-point buffers are row-major with a fixed number of values per point
/// (`n_low_dims` for positions, `n_low_dims + 1` for the field, 1 for
/// masks), so a compaction or swap that leaves any of them with a different
/// row count is a bug.
#[macro_export]
macro_rules! assert_rows {
    ($n:expr; $(($buf:expr, $width:expr)),+ $(,)?) => {{
        let n: usize = $n;
        let shapes: Vec<(usize, usize)> = vec![$(($buf.len(), $width)),+];
        if let Some(&(len, width)) = shapes.iter().find(|&&(len, width)| len != n * width) {
            panic!(
                "Buffer of {} values does not hold {} rows of width {}; all shapes: {:?}",
                len, n, width, shapes
            );
        }
    }};
}
