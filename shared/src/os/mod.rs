pub mod stopper;
