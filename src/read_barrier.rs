/// Read barrier style, fixed at compile time. The collector and the mutator
/// barrier code monomorphize per style; there is no runtime dispatch on it.
///
/// Baker keeps the color in the object header: a load out of a gray holder
/// takes the slow path. Table lookup keeps no per-object state on the mutator
/// path; instead the loaded address is checked against the per-region table.
pub trait ReadBarrierPolicy: 'static + Copy + Default + Send + Sync {
    /// Keep tri-color state in object headers and gray to-space copies before
    /// publishing their forwarding pointer.
    const USE_BAKER: bool;
    /// Route barrier decisions through the region-granular byte table.
    const USE_TABLE_LOOKUP: bool;
}

#[derive(Clone, Copy, Default)]
pub struct BakerReadBarrier;

impl ReadBarrierPolicy for BakerReadBarrier {
    const USE_BAKER: bool = true;
    const USE_TABLE_LOOKUP: bool = false;
}

#[derive(Clone, Copy, Default)]
pub struct TableLookupReadBarrier;

impl ReadBarrierPolicy for TableLookupReadBarrier {
    const USE_BAKER: bool = false;
    const USE_TABLE_LOOKUP: bool = true;
}
