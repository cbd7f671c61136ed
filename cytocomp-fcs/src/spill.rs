//! Embedded spillover matrix keywords.

use crate::text::TextSegment;

/// Keywords checked for a spillover matrix, in priority order.
pub const SPILLOVER_KEYS: [&str; 4] = ["SPILL", "$SPILL", "SPILLOVER", "$SPILLOVER"];

/// Parses the first spillover keyword present into an `n_params²` matrix,
/// indexed `[to * n_params + from]` like the compensation engine.
///
/// The value reads `"<n>,<name1>,...,<namen>,<v11>,...,<vnn>"` (`;` is also
/// accepted as separator). Row `r`, column `c` of the block lands at the same
/// positions of the result, for `r, c < min(n, n_params)`; names are not
/// matched against parameter labels. The diagonal is zero.
///
/// Returns `None`, without failing the decode, when no keyword is present,
/// `n` is not a positive integer, or fewer than `n²` numeric values follow
/// the names.
#[must_use]
pub fn parse_spillover(text: &TextSegment, n_params: usize) -> Option<Vec<f64>> {
    let (key, raw) = SPILLOVER_KEYS
        .iter()
        .find_map(|&k| text.get(k).map(|v| (k, v)))?;

    let parts: Vec<&str> = raw
        .split([',', ';'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();

    let Some(n) = parts.first().and_then(|s| s.parse::<usize>().ok()).filter(|&n| n > 0) else {
        log::warn!("{key}: leading matrix size is not a positive integer, ignoring");
        return None;
    };

    let Some(cells) = n.checked_mul(n) else {
        log::warn!("{key}: matrix size {n} is too large, ignoring");
        return None;
    };
    let Some(matrix_len) = n_params.checked_mul(n_params) else {
        log::warn!("{key}: {n_params} parameters is too many for a spillover matrix, ignoring");
        return None;
    };

    let values: Option<Vec<f64>> = parts
        .get(n.saturating_add(1)..)
        .unwrap_or_default()
        .iter()
        .take(cells)
        .map(|s| s.parse::<f64>().ok().filter(|v| v.is_finite()))
        .collect();
    let Some(values) = values.filter(|v| v.len() == cells) else {
        log::warn!("{key}: expected {cells} numeric values after {n} names, ignoring");
        return None;
    };

    let mut matrix = vec![0.0; matrix_len];
    let m = n.min(n_params);
    for r in 0..m {
        for c in 0..m {
            if r != c {
                matrix[r * n_params + c] = values[r * n + c];
            }
        }
    }
    log::debug!("{key}: {n}x{n} spillover block applied to {n_params} parameters");
    Some(matrix)
}
