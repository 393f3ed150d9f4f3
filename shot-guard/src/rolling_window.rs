use std::num::NonZeroUsize;

/// One time slice of a rolling window.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Bucket {
    points: Vec<f64>,
    count: u64,
}

impl Bucket {
    /// Recorded points. In accumulate mode there is at most one.
    pub fn points(&self) -> &[f64] {
        &self.points
    }

    /// Number of writes since the last reset.
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn sum(&self) -> f64 {
        self.points.iter().sum()
    }

    fn append(&mut self, val: f64) {
        self.points.push(val);
        self.count += 1;
    }

    fn accumulate(&mut self, val: f64) {
        match self.points.first_mut() {
            Some(point) => {
                *point += val;
                self.count += 1;
            }
            None => self.append(val),
        }
    }

    fn reset(&mut self) {
        self.points.clear();
        self.count = 0;
    }
}

/// A fixed-size ring of buckets. The bucket after `i` is `(i + 1) % size`.
#[derive(Clone, Debug)]
pub struct Window {
    buckets: Box<[Bucket]>,
}

impl Window {
    pub fn new(size: NonZeroUsize) -> Self {
        Self {
            buckets: vec![Bucket::default(); size.get()].into_boxed_slice(),
        }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.buckets.len()
    }

    pub fn bucket(&self, offset: usize) -> &Bucket {
        &self.buckets[offset % self.size()]
    }

    pub fn append(&mut self, offset: usize, val: f64) {
        let size = self.size();
        self.buckets[offset % size].append(val);
    }

    /// Add `val` to the single running point of the bucket at `offset`.
    pub fn add(&mut self, offset: usize, val: f64) {
        let size = self.size();
        self.buckets[offset % size].accumulate(val);
    }

    pub fn reset_bucket(&mut self, offset: usize) {
        let size = self.size();
        self.buckets[offset % size].reset();
    }

    pub fn reset(&mut self) {
        self.buckets.iter_mut().for_each(Bucket::reset);
    }

    /// A cursor over `count` buckets starting at `offset`, in ring order.
    pub fn iter(&self, offset: usize, count: usize) -> BucketIter<'_> {
        BucketIter {
            buckets: &self.buckets,
            cur: offset % self.size(),
            remaining: count,
        }
    }
}

/// A bounded cursor over the live buckets of a [`Window`].
#[derive(Clone, Debug)]
pub struct BucketIter<'a> {
    buckets: &'a [Bucket],
    cur: usize,
    remaining: usize,
}

impl<'a> BucketIter<'a> {
    /// Whether another bucket can be taken.
    pub fn has_next(&self) -> bool {
        self.remaining > 0
    }

    /// Take the next bucket.
    ///
    /// # Panics
    ///
    /// Panics if the cursor already yielded all of its buckets. Asking for more
    /// would hand out stale data.
    pub fn bucket(&mut self) -> &'a Bucket {
        assert!(self.has_next(), "bucket iterator exhausted");
        let bucket = &self.buckets[self.cur];
        self.cur = (self.cur + 1) % self.buckets.len();
        self.remaining -= 1;
        bucket
    }
}

impl<'a> Iterator for BucketIter<'a> {
    type Item = &'a Bucket;

    fn next(&mut self) -> Option<Self::Item> {
        self.has_next().then(|| self.bucket())
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for BucketIter<'_> {}
