use std::sync::Arc;

use burn::{
    data::{
        dataloader::{batcher::Batcher, DataLoader, DataLoaderBuilder},
        dataset::{vision::MnistItem, Dataset},
    },
    prelude::*,
};

use crate::config::RunConfig;

/// Mean of the MNIST training pixels on the `[0, 1]` scale.
pub const MNIST_MEAN: f32 = 0.1307;
/// Standard deviation of the MNIST training pixels on the `[0, 1]` scale.
pub const MNIST_STD: f32 = 0.3081;

const WIDTH: usize = 28;
const HEIGHT: usize = 28;

/// A data loader producing [MNIST batches](MnistBatch) on backend `B`.
pub type MnistLoader<B> = Arc<dyn DataLoader<B, MnistBatch<B>>>;

/// Turns MNIST items into normalized image and label tensors.
#[derive(Clone, Debug, Default)]
pub struct MnistBatcher {}

/// A batch of normalized images with their labels.
#[derive(Clone, Debug)]
pub struct MnistBatch<B: Backend> {
    /// Images of shape `[batch_size, 28, 28]`.
    pub images: Tensor<B, 3>,
    /// Class labels of shape `[batch_size]`.
    pub targets: Tensor<B, 1, Int>,
}

impl<B: Backend> MnistBatch<B> {
    /// Number of items in the batch.
    pub fn len(&self) -> usize {
        self.targets.dims()[0]
    }

    /// True when the batch holds no item.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<B: Backend> Batcher<B, MnistItem, MnistBatch<B>> for MnistBatcher {
    fn batch(&self, items: Vec<MnistItem>, device: &B::Device) -> MnistBatch<B> {
        let images = items
            .iter()
            .map(|item| TensorData::from(item.image).convert::<B::FloatElem>())
            .map(|data| Tensor::<B, 2>::from_data(data, device))
            .map(|tensor| tensor.reshape([1, HEIGHT, WIDTH]))
            // Scale between [0, 1], then standardize with the training set statistics.
            .map(|tensor| ((tensor / 255) - MNIST_MEAN) / MNIST_STD)
            .collect();

        let targets = items
            .iter()
            .map(|item| {
                Tensor::<B, 1, Int>::from_data(
                    [(item.label as i64).elem::<B::IntElem>()],
                    device,
                )
            })
            .collect();

        let images = Tensor::cat(images, 0);
        let targets = Tensor::cat(targets, 0);

        MnistBatch { images, targets }
    }
}

/// Build the training loader: batches of `batch_size_train`, reshuffled every epoch.
pub fn train_loader<B, D>(dataset: D, config: &RunConfig, device: &B::Device) -> MnistLoader<B>
where
    B: Backend,
    D: Dataset<MnistItem> + 'static,
{
    DataLoaderBuilder::new(MnistBatcher::default())
        .batch_size(config.batch_size_train)
        .shuffle(config.seed)
        .num_workers(config.num_workers)
        .set_device(device.clone())
        .build(dataset)
}

/// Build the evaluation loader: batches of `batch_size_test` in dataset order.
///
/// A single worker keeps the batch order fixed across passes.
pub fn test_loader<B, D>(dataset: D, config: &RunConfig, device: &B::Device) -> MnistLoader<B>
where
    B: Backend,
    D: Dataset<MnistItem> + 'static,
{
    DataLoaderBuilder::new(MnistBatcher::default())
        .batch_size(config.batch_size_test)
        .set_device(device.clone())
        .build(dataset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TestBackend;
    use burn::data::dataset::InMemDataset;

    fn item(pixel: f32, label: u8) -> MnistItem {
        MnistItem {
            image: [[pixel; WIDTH]; HEIGHT],
            label,
        }
    }

    #[test]
    fn batch_normalizes_pixels_and_keeps_labels() {
        let device = Default::default();
        let batcher = MnistBatcher::default();

        let batch: MnistBatch<TestBackend> =
            batcher.batch(vec![item(0.0, 3), item(255.0, 7)], &device);

        assert_eq!(batch.images.dims(), [2, HEIGHT, WIDTH]);
        assert_eq!(batch.len(), 2);

        let pixels = batch.images.into_data().to_vec::<f32>().unwrap();
        let black = (0.0 - MNIST_MEAN) / MNIST_STD;
        let white = (1.0 - MNIST_MEAN) / MNIST_STD;
        assert!((pixels[0] - black).abs() < 1e-5);
        assert!((pixels[WIDTH * HEIGHT] - white).abs() < 1e-5);

        let labels = batch.targets.into_data().to_vec::<i64>().unwrap();
        assert_eq!(labels, vec![3, 7]);
    }

    #[test]
    fn test_loader_keeps_dataset_order() {
        let device = Default::default();
        let config = RunConfig::new(1, 2, 2, 0.01);
        let items = (0..5).map(|i| item(0.0, i as u8)).collect();

        let loader = test_loader::<TestBackend, _>(InMemDataset::new(items), &config, &device);

        let labels: Vec<i64> = loader
            .iter()
            .flat_map(|batch| batch.targets.into_data().to_vec::<i64>().unwrap())
            .collect();
        assert_eq!(labels, vec![0, 1, 2, 3, 4]);
        assert_eq!(loader.num_items(), 5);
    }
}
