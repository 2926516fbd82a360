use std::cmp::Ordering;

/// Total order over tree keys. Two keys are the same key exactly when
/// `compare` returns `Ordering::Equal`.
pub trait Comparator<K>: Send + Sync {
    fn compare(&self, a: &K, b: &K) -> Ordering;
}

/// The key type's own `Ord`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NaturalOrder;

impl<K: Ord> Comparator<K> for NaturalOrder {
    fn compare(&self, a: &K, b: &K) -> Ordering {
        a.cmp(b)
    }
}

/// Adapts a closure into a [`Comparator`].
pub struct ComparatorFn<F>(pub F);

impl<K, F> Comparator<K> for ComparatorFn<F>
where
    F: Fn(&K, &K) -> Ordering + Send + Sync,
{
    fn compare(&self, a: &K, b: &K) -> Ordering {
        (self.0)(a, b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_comparator() {
        let reverse = ComparatorFn(|a: &i32, b: &i32| b.cmp(a));
        assert_eq!(reverse.compare(&1, &2), Ordering::Greater);
        assert_eq!(NaturalOrder.compare(&1, &2), Ordering::Less);

        let case_insensitive =
            ComparatorFn(|a: &String, b: &String| a.to_lowercase().cmp(&b.to_lowercase()));
        assert_eq!(
            case_insensitive.compare(&"Key".to_string(), &"kEY".to_string()),
            Ordering::Equal
        );
    }
}
