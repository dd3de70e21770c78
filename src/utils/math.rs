use std::cmp::Ordering;

#[inline]
fn median_of_three_index(data: &[f64], low: usize, mid: usize, high: usize) -> usize {
    let a = data[low];
    let b = data[mid];
    let c = data[high];
    if (a <= b && b <= c) || (c <= b && b <= a) {
        mid
    } else if (b <= a && a <= c) || (c <= a && a <= b) {
        low
    } else {
        high
    }
}

/// Partition data in-place using Lomuto scheme
fn partition_inplace(data: &mut [f64], low: usize, high: usize) -> usize {
    if low >= high {
        return low;
    }
    let mid = low + (high - low) / 2;
    let pivot_index = median_of_three_index(data, low, mid, high);

    data.swap(pivot_index, high);
    let pivot_value = data[high];

    let mut i = low;
    for j in low..high {
        if data[j] <= pivot_value {
            data.swap(i, j);
            i += 1;
        }
    }
    data.swap(i, high);
    i
}

// Iterative Quickselect using median-of-three to avoid worst case quadratic runtime
fn select_inplace(data: &mut [f64], k: usize) -> Option<f64> {
    if data.is_empty() || k >= data.len() {
        return None;
    }

    let mut low = 0;
    let mut high = data.len() - 1;

    loop {
        if low == high {
            return if low == k { Some(data[low]) } else { None };
        }
        let pivot_index = partition_inplace(data, low, high);
        match pivot_index.cmp(&k) {
            Ordering::Equal => return Some(data[k]),
            Ordering::Greater => {
                if pivot_index == 0 {
                    return None;
                }
                high = pivot_index - 1;
            }
            Ordering::Less => {
                low = pivot_index + 1;
            }
        }
        if low > high {
            return None;
        }
    }
}

pub fn median(data: &[f64]) -> Option<f64> {
    let size = data.len();
    if size == 0 {
        return None;
    }
    let mut data_copy = data.to_vec();
    match size {
        even if even % 2 == 0 => {
            let k1 = (even / 2) - 1;
            let k2 = even / 2;
            let fst_med_opt = select_inplace(&mut data_copy, k1);
            match fst_med_opt {
                Some(fst) => {
                    let min_in_right_partition =
                        data_copy[k2..].iter().copied().reduce(f64::min);
                    min_in_right_partition.map(|snd| (fst + snd) / 2.0)
                }
                None => None,
            }
        }
        odd => {
            let k = odd / 2;
            select_inplace(&mut data_copy, k)
        }
    }
}

pub fn mean(data: &[f64]) -> Option<f64> {
    if data.is_empty() {
        return None;
    }
    Some(data.iter().sum::<f64>() / data.len() as f64)
}

pub fn std_dev(data: &[f64]) -> Option<f64> {
    let m = mean(data)?;
    let var = data.iter().map(|x| (x - m) * (x - m)).sum::<f64>() / data.len() as f64;
    Some(var.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rng, seq::SliceRandom};

    fn naive_median(data: &[f64]) -> Option<f64> {
        let size = data.len();
        if size == 0 {
            return None;
        }
        let mut sorted_data = data.to_vec();
        sorted_data.sort_by(f64::total_cmp);
        if size % 2 == 0 {
            let mid1 = sorted_data[(size / 2) - 1];
            let mid2 = sorted_data[size / 2];
            Some((mid1 + mid2) / 2.0)
        } else {
            Some(sorted_data[size / 2])
        }
    }

    #[test]
    fn test_median_empty() {
        let data: [f64; 0] = [];
        assert_eq!(median(&data), None);
    }

    #[test]
    fn test_median_single_element() {
        let data = [5.0];
        assert_eq!(median(&data), Some(5.0));
    }

    #[test]
    fn test_median_odd_count_unsorted() {
        let data = [0.3, 0.1, 0.4, 0.1, 0.5];
        assert_eq!(median(&data), Some(0.3));
        assert_eq!(median(&data), naive_median(&data));
    }

    #[test]
    fn test_median_even_count_unsorted() {
        let data = [3.0, 1.0, 4.0, 2.0];
        assert_eq!(median(&data), Some(2.5));
        assert_eq!(median(&data), naive_median(&data));
    }

    #[test]
    fn test_median_with_duplicates() {
        let data = [1.0, 2.0, 2.0, 2.0, 3.0];
        assert_eq!(median(&data), Some(2.0));
        assert_eq!(median(&data), naive_median(&data));
    }

    #[test]
    fn test_median_all_same() {
        let data = [0.7; 5];
        assert_eq!(median(&data), Some(0.7));
    }

    #[test]
    fn test_median_large_random() {
        let mut data: Vec<f64> = (1..=1001).map(f64::from).collect();
        data.shuffle(&mut rng());
        assert_eq!(median(&data), Some(501.0));
        assert_eq!(median(&data), naive_median(&data));

        let mut data_even: Vec<f64> = (1..=1000).map(f64::from).collect();
        data_even.shuffle(&mut rng());
        assert_eq!(median(&data_even), Some(500.5));
        assert_eq!(median(&data_even), naive_median(&data_even));
    }

    #[test]
    fn test_mean_and_std() {
        let data = [0.0, 0.5, 1.0];
        assert_eq!(mean(&data), Some(0.5));
        let sd = std_dev(&data).unwrap();
        assert!((sd - (1.0f64 / 6.0).sqrt()).abs() < 1e-12);
        assert_eq!(mean(&[]), None);
        assert_eq!(std_dev(&[]), None);
    }
}
