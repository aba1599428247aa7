/// Split `pages` into at most `workers` contiguous, disjoint chunks whose sizes
/// differ by at most one. Order inside each chunk is preserved.
pub fn partition(pages: &[u32], workers: usize) -> Vec<Vec<u32>> {
    let workers = workers.clamp(1, pages.len().max(1));
    let base = pages.len() / workers;
    let extra = pages.len() % workers;

    let mut chunks = Vec::with_capacity(workers);
    let mut start = 0;
    for i in 0..workers {
        let len = base + usize::from(i < extra);
        chunks.push(pages[start..start + len].to_vec());
        start += len;
    }
    chunks
}
