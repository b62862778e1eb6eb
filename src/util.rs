use std::ops::Range;

/// Contiguous share of `num_items` for worker `worker_id` out of `num_workers`. The first
/// `num_items % num_workers` workers get one extra item.
pub fn get_partition_range(num_workers: usize, worker_id: usize, num_items: usize) -> Range<usize> {
    let min_partition_size = num_items / num_workers;
    let remainder = num_items % num_workers;

    let start = min_partition_size * worker_id + worker_id.min(remainder);
    let partition_size = if worker_id < remainder {
        min_partition_size + 1
    } else {
        min_partition_size
    };

    start..start + partition_size
}

/// Splits `items` into `num_workers` contiguous groups following `get_partition_range`.
pub fn split_for_workers<T>(mut items: Vec<T>, num_workers: usize) -> Vec<Vec<T>> {
    let num_items = items.len();
    let mut groups = Vec::with_capacity(num_workers);

    for worker_id in (0..num_workers).rev() {
        let range = get_partition_range(num_workers, worker_id, num_items);
        groups.push(items.split_off(range.start));
    }
    groups.reverse();

    groups
}
