const UNIT: u64 = 1024;
const PREFIXES: [char; 6] = ['K', 'M', 'G', 'T', 'P', 'E'];

/// Formats a byte count using binary units, e.g. `1536` becomes `"1.5 KiB"`.
///
/// Counts below 1024 are printed as whole bytes (`"512 B"`), everything else
/// with exactly one fractional digit.
pub fn format_bytes(bytes: u64) -> String {
    if bytes < UNIT {
        return format!("{} B", bytes);
    }
    let mut div = UNIT;
    let mut exp = 0;
    let mut n = bytes / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    format!("{:.1} {}iB", bytes as f64 / div as f64, PREFIXES[exp])
}
