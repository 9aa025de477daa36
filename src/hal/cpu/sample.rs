use std::f32::consts::PI;

use crate::{
    hal::ops::SampleOp,
    loom::{engine::ExecError, num::Float, resource::RandomResource, storage::Chunk},
};

fn sample_typed<T: Float>(op: SampleOp, random: &RandomResource, output: &Chunk) {
    let z: Vec<T> = random.with_rng(|rng| match op {
        SampleOp::Uniform { low, high } => (0..output.len())
            .map(|_| T::from_f32(low + (high - low) * rng.f32()))
            .collect(),
        SampleOp::Gaussian { mean, stdev } => (0..output.len())
            .map(|_| {
                // Box-Muller; `1 - u` keeps the logarithm finite
                let u = 1.0 - rng.f32();
                let v = rng.f32();
                let x = (-2.0 * u.ln()).sqrt() * (2.0 * PI * v).cos();
                T::from_f32(mean + stdev * x)
            })
            .collect(),
    });
    output.write_with(|output: &mut [T]| output.copy_from_slice(&z));
}

/// Fills `output` with samples drawn from `random`.
pub fn sample(op: SampleOp, random: &RandomResource, output: &Chunk) -> Result<(), ExecError> {
    dispatch_float!(output.data_type(), T => {
        sample_typed::<T>(op, random, output);
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use crate::{
        hal::ops::SampleOp,
        loom::{
            device::Context,
            engine::{Engine, NaiveEngine},
            num::DataType,
            resource::ResourceManager,
            storage::Chunk,
        },
    };

    #[test]
    fn test_sample() -> Result<(), Box<dyn Error>> {
        let engine = Engine::Naive(NaiveEngine::new());
        let resources = ResourceManager::new(engine.clone());
        let random = resources.request_random(Context::cpu());

        let x = Chunk::new(engine.clone(), Context::cpu(), DataType::F32, 4096);
        super::sample(SampleOp::Uniform { low: -1.0, high: 3.0 }, &random, &x)?;
        x.read_with(|x: &[f32]| {
            assert!(x.iter().all(|&x| (-1.0..=3.0).contains(&x)));
            let mean = x.iter().sum::<f32>() / x.len() as f32;
            assert!((mean - 1.0).abs() < 0.2, "mean {mean}");
        });

        super::sample(SampleOp::Gaussian { mean: 2.0, stdev: 0.5 }, &random, &x)?;
        x.read_with(|x: &[f32]| {
            assert!(x.iter().all(|x| x.is_finite()));
            let mean = x.iter().sum::<f32>() / x.len() as f32;
            assert!((mean - 2.0).abs() < 0.1, "mean {mean}");
        });
        Ok(())
    }
}
