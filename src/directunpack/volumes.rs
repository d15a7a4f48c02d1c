//! RAR volume naming
//!
//! Three conventions are recognized:
//! - `name.part01.rar`, `name.part02.rar`, ... (volume = part number)
//! - `name.rar`, `name.r00`, `name.r01`, ... (`.rar` is volume 1, `.rNN` is NN + 2)
//! - a lone `name.rar`

/// Set name and 1-based volume number of a RAR file
pub(crate) fn rar_volume(filename: &str) -> Option<(String, u32)> {
    let lower = filename.to_ascii_lowercase();

    if let Some(stem) = lower.strip_suffix(".rar") {
        let base = &filename[..stem.len()];
        if let Some(part_idx) = stem.rfind(".part") {
            let digits = &stem[part_idx + 5..];
            if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
                let volume = digits.parse().ok()?;
                return Some((filename[..part_idx].to_string(), volume));
            }
        }
        return Some((base.to_string(), 1));
    }

    let dot = lower.rfind('.')?;
    let ext = &lower[dot + 1..];
    if ext.len() >= 3
        && let Some(digits) = ext.strip_prefix('r')
        && digits.chars().all(|c| c.is_ascii_digit())
    {
        let n: u32 = digits.parse().ok()?;
        return Some((filename[..dot].to_string(), n + 2));
    }
    None
}

/// Whether `filename` is any volume of a RAR set
pub(crate) fn is_rar_file(filename: &str) -> bool {
    rar_volume(filename).is_some()
}

/// Whether `filename` is the volume extraction starts from
pub(crate) fn is_first_rar_volume(filename: &str) -> bool {
    rar_volume(filename).is_some_and(|(_, volume)| volume == 1)
}
