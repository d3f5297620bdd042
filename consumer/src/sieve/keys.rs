/// File name for the n-th accepted slide of a run.
/// e.g. "slide_00042.jpg"
pub fn slide_file_name(prefix: &str, index: u64, digits: usize) -> String {
    format!("{prefix}{index:0digits$}.jpg")
}
