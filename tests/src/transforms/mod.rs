mod dispatcher;
mod flatten;
mod rgf;
