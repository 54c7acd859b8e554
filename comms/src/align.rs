/// Plain numeric types a receive buffer can be made of.
pub trait Align1: bytemuck::Pod {}

impl Align1 for u8 {}
impl Align1 for u32 {}
impl Align1 for u64 {}
impl Align1 for f32 {}
impl Align1 for f64 {}

/// Buffer element types aligned to at least 4 bytes.
///
/// Receiving into a buffer of these guarantees the tensor payload, which starts
/// right after a 4 byte header, can be viewed as `&[f32]` without copying.
pub trait Align4: Align1 {}

impl Align4 for u32 {}
impl Align4 for u64 {}
impl Align4 for f32 {}
impl Align4 for f64 {}
