use std::sync::Arc;

use proptest::prelude::*;

use prism_core::context::PlainBackend;
use prism_core::frame::Rect;
use prism_core::{
    Context, DataType, Frame, ImageFormat, MediaType, MemoryType, Tensor, TensorInfo, keys,
};

fn host_tensor(ctx: &Arc<Context>, shape: [usize; 3]) -> Arc<Tensor> {
    let info = TensorInfo::new(shape, DataType::UInt8);
    let mut bytes: Vec<u8> = (0..info.nbytes()).map(|i| (i % 251) as u8).collect();
    let ptr = bytes.as_mut_ptr();
    // SAFETY: the tensor owns `bytes`; moving the Vec keeps its heap buffer.
    unsafe { Tensor::builder(info, MemoryType::Cpu).host_ptr(ptr) }
        .owning(bytes)
        .context(ctx)
        .build()
        .unwrap()
}

proptest! {
    #[test]
    fn slice_views_the_parent_bytes(
        h in 1usize..24,
        w in 1usize..24,
        c in 1usize..4,
        y in (0usize..24, 1usize..24),
        x in (0usize..24, 1usize..24),
    ) {
        let ctx = Context::new(PlainBackend::new(MemoryType::Cpu));
        let tensor = host_tensor(&ctx, [h, w, c]);
        let y0 = y.0 % h;
        let y1 = (y0 + y.1).min(h);
        let x0 = x.0 % w;
        let x1 = (x0 + x.1).min(w);

        let view = tensor.slice(&[y0..y1, x0..x1]).unwrap();
        prop_assert!(Arc::ptr_eq(&view.parent().unwrap(), &tensor));
        prop_assert_eq!(view.info().shape(), &[y1 - y0, x1 - x0, c][..]);
        prop_assert_eq!(view.info().stride(), tensor.info().stride());

        let base = tensor.data().unwrap() as usize;
        let delta = y0 * w * c + x0 * c;
        prop_assert_eq!(view.data().unwrap() as usize, base + delta);
        prop_assert_eq!(view.offset(), delta);

        let all = tensor.read_bytes().unwrap();
        let expected: Vec<u8> = (y0..y1)
            .flat_map(|row| all[row * w * c + x0 * c..row * w * c + x1 * c].to_vec())
            .collect();
        prop_assert_eq!(view.read_bytes().unwrap(), expected);
    }
}

#[test]
fn region_scales_chroma_planes() {
    let ctx = Context::new(PlainBackend::new(MemoryType::Cpu));
    let y = host_tensor(&ctx, [32, 64, 1]);
    let uv = host_tensor(&ctx, [16, 32, 2]);
    let frame = Frame::new(MediaType::Image, ImageFormat::Nv12.code(), vec![y, uv]).unwrap();

    let region = Frame::region(&frame, Rect::new(8, 4, 16, 8)).unwrap();
    assert_eq!(region.tensor(0).unwrap().info().shape(), &[8, 16, 1]);
    assert_eq!(region.tensor(1).unwrap().info().shape(), &[4, 8, 2]);
    assert_eq!(region.tensor(1).unwrap().offset(), 2 * 64 + 4 * 2);
    assert_eq!(frame.regions().len(), 1);

    drop(frame);
    // Regions keep their parent tensors alive.
    assert_eq!(region.tensor(0).unwrap().read_bytes().unwrap().len(), 8 * 16);
}

#[test]
fn non_host_slice_records_offset_handle() {
    let ctx = Context::new(PlainBackend::new(MemoryType::Vaapi));
    let info = TensorInfo::with_stride([16, 16, 1], [64, 1, 1], DataType::UInt8).unwrap();
    let surface = Tensor::builder(info, MemoryType::Vaapi)
        .handle(keys::VA_SURFACE_ID, 42)
        .context(&ctx)
        .build()
        .unwrap();

    let view = surface.slice(&[2..4]).unwrap();
    assert_eq!(view.handle("").unwrap(), 42);
    assert_eq!(view.handle(keys::OFFSET).unwrap(), 128);
    assert_eq!(view.offset(), 128);
    assert!(view.data().is_err());
}
